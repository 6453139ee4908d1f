//! Transfer codecs: how a directory tree is laid onto the session stream.
//!
//! Both sides run these on a blocking thread over a synchronous bridge of the
//! session's buffered halves, so everything here is plain `Read`/`Write`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use drop_core::header::{decode_header, EntryHeader, HEADER_FIXED_LEN};
use drop_core::path;
use drop_core::protocol::BUF_SIZE;
use drop_core::HeaderError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{DropError, Result};

/// Encoding used for the tree once a clone is acknowledged. Both peers must agree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferCodec {
    /// Gzip-compressed tar stream.
    #[default]
    TarGzip,
    /// Uncompressed tar stream.
    Tar,
    /// Per-entry framed headers followed by raw content, ended by a done header.
    Framed,
}

/// Counters for one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub dirs: u64,
    pub files: u64,
    pub bytes: u64,
}

impl TransferCodec {
    /// Stream the tree under `root` into `out`.
    pub fn encode<W: Write>(self, root: &Path, out: W) -> Result<TransferStats> {
        match self {
            TransferCodec::TarGzip => {
                let gz = GzEncoder::new(out, Compression::default());
                let (stats, gz) = write_archive(root, gz)?;
                gz.finish()?;
                Ok(stats)
            }
            TransferCodec::Tar => write_archive(root, out).map(|(stats, _)| stats),
            TransferCodec::Framed => write_framed(root, out),
        }
    }

    /// Recreate the tree carried by `input` under `dest`.
    pub fn decode<R: Read>(self, input: R, dest: &Path) -> Result<TransferStats> {
        fs::create_dir_all(dest).map_err(DropError::fs(dest))?;
        match self {
            TransferCodec::TarGzip => read_archive(GzDecoder::new(input), dest),
            TransferCodec::Tar => read_archive(input, dest),
            TransferCodec::Framed => read_framed(input, dest),
        }
    }
}

/// One shared entry, visited in lexical walk order.
enum Visit {
    Dir { relative: std::path::PathBuf },
    File {
        relative: std::path::PathBuf,
        path: std::path::PathBuf,
    },
}

/// Walk `root` (excluding itself) sorted by file name. Symlinks and special files are
/// skipped; entries that disappear while walking are skipped too.
fn walk(root: &Path) -> impl Iterator<Item = Result<Visit>> + '_ {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                    warn!("entry vanished during walk: {}", e);
                    return None;
                }
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    return Some(Err(DropError::FileSystem {
                        path,
                        source: e.into(),
                    }));
                }
            };
            let relative = entry.path().strip_prefix(root).ok()?.to_path_buf();
            let file_type = entry.file_type();
            if file_type.is_dir() {
                Some(Ok(Visit::Dir { relative }))
            } else if file_type.is_file() {
                Some(Ok(Visit::File {
                    relative,
                    path: entry.into_path(),
                }))
            } else {
                debug!("skipping non-regular entry {}", entry.path().display());
                None
            }
        })
}

/// Open a file for sending; `None` if it vanished since the walk listed it.
fn open_for_send(path: &Path) -> Result<Option<File>> {
    match File::open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("file vanished before sending: {}", path.display());
            Ok(None)
        }
        Err(e) => Err(DropError::FileSystem {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn write_archive<W: Write>(root: &Path, out: W) -> Result<(TransferStats, W)> {
    let mut builder = tar::Builder::new(out);
    let mut stats = TransferStats::default();
    for visit in walk(root) {
        match visit? {
            Visit::Dir { relative } => {
                builder.append_dir(&relative, root.join(&relative))?;
                stats.dirs += 1;
            }
            Visit::File { relative, path } => {
                let Some(file) = open_for_send(&path)? else {
                    continue;
                };
                let meta = file.metadata().map_err(DropError::fs(&path))?;
                append_sized(&mut builder, &relative, &meta, file)?;
                stats.files += 1;
                stats.bytes += meta.len();
            }
        }
    }
    let out = builder.into_inner()?;
    Ok((stats, out))
}

/// Append a regular file whose header is built from `meta`. Exactly `meta.len()` bytes are
/// written whatever the file holds by now: growth is cut off and shrinkage is zero-padded.
fn append_sized<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    relative: &Path,
    meta: &fs::Metadata,
    file: R,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    header.set_entry_type(tar::EntryType::Regular);
    let len = meta.len();
    header.set_size(len);
    let data = file.take(len).chain(io::repeat(0)).take(len);
    builder.append_data(&mut header, relative, data)?;
    Ok(())
}

fn read_archive<R: Read>(input: R, dest: &Path) -> Result<TransferStats> {
    let mut archive = tar::Archive::new(input);
    let mut stats = TransferStats::default();
    for entry in archive.entries().map_err(DropError::stream)? {
        let mut entry = entry.map_err(DropError::stream)?;
        let stored = entry.path().map_err(DropError::stream)?.into_owned();
        let target = path::safe_join(dest, &stored)?;
        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&target).map_err(DropError::fs(&target))?;
                stats.dirs += 1;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let size = entry.size();
                write_file(&target, &mut entry, size)?;
                stats.files += 1;
                stats.bytes += size;
            }
            other => debug!("skipping {:?} entry {}", other, stored.display()),
        }
    }
    Ok(stats)
}

fn write_framed<W: Write>(root: &Path, mut out: W) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    for visit in walk(root) {
        match visit? {
            Visit::Dir { relative } => {
                out.write_all(&EntryHeader::directory(path::to_wire(&relative)).encode()?)?;
                stats.dirs += 1;
            }
            Visit::File { relative, path } => {
                let Some(file) = open_for_send(&path)? else {
                    continue;
                };
                let size = file.metadata().map_err(DropError::fs(&path))?.len();
                out.write_all(&EntryHeader::file(path::to_wire(&relative), size).encode()?)?;
                let sent = io::copy(&mut file.take(size), &mut out)?;
                if sent < size {
                    // File shrank after its size was framed; keep the stream aligned.
                    warn!("{} shrank while sending, padding", path.display());
                    io::copy(&mut io::repeat(0).take(size - sent), &mut out)?;
                }
                stats.files += 1;
                stats.bytes += size;
            }
        }
    }
    out.write_all(&EntryHeader::done().encode()?)?;
    out.flush()?;
    Ok(stats)
}

fn read_framed<R: Read>(mut input: R, dest: &Path) -> Result<TransferStats> {
    let mut stats = TransferStats::default();
    loop {
        let header = read_entry_header(&mut input)?;
        if header.is_complete() {
            return Ok(stats);
        }
        let target = path::safe_join(dest, Path::new(&header.path))?;
        if header.is_dir() {
            fs::create_dir_all(&target).map_err(DropError::fs(&target))?;
            stats.dirs += 1;
        } else {
            write_file(&target, &mut input, header.size)?;
            stats.files += 1;
            stats.bytes += header.size;
        }
    }
}

fn read_entry_header<R: Read>(input: &mut R) -> Result<EntryHeader> {
    let mut buf = vec![0u8; HEADER_FIXED_LEN];
    input.read_exact(&mut buf).map_err(DropError::stream)?;
    loop {
        match decode_header(&buf) {
            Ok((header, _)) => return Ok(header),
            Err(HeaderError::Short { needed }) => {
                let have = buf.len();
                buf.resize(needed, 0);
                input.read_exact(&mut buf[have..]).map_err(DropError::stream)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Create or truncate `target` and copy exactly `size` bytes into it.
fn write_file<R: Read>(target: &Path, input: &mut R, size: u64) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(DropError::fs(parent))?;
    }
    let mut file = File::create(target).map_err(DropError::fs(target))?;
    copy_exact(input, &mut file, size).map_err(|e| match e {
        CopyError::Read(e) => DropError::stream(e),
        CopyError::Write(e) => DropError::FileSystem {
            path: target.to_path_buf(),
            source: e,
        },
    })
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

fn copy_exact<R: Read, W: Write>(
    input: &mut R,
    out: &mut W,
    size: u64,
) -> std::result::Result<(), CopyError> {
    let mut buf = [0u8; BUF_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(BUF_SIZE as u64) as usize;
        let n = match input.read(&mut buf[..want]) {
            Ok(0) => return Err(CopyError::Read(io::ErrorKind::UnexpectedEof.into())),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        out.write_all(&buf[..n]).map_err(CopyError::Write)?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SIZES: [usize; 5] = [0, 1, BUF_SIZE - 1, BUF_SIZE, BUF_SIZE + 1];

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        for (i, len) in SIZES.iter().enumerate() {
            fs::write(root.join(format!("f{i}.bin")), content(*len, i as u8)).unwrap();
            fs::write(
                root.join("nested/deeper").join(format!("g{i}.bin")),
                content(*len, 100 + i as u8),
            )
            .unwrap();
        }
        fs::write(root.join("nested/readme.txt"), b"hello").unwrap();
    }

    /// Relative path -> contents (`None` for directories).
    fn snapshot(root: &Path) -> Vec<(PathBuf, Option<Vec<u8>>)> {
        WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|e| {
                let e = e.unwrap();
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                let data = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
                (rel, data)
            })
            .collect()
    }

    fn roundtrip(codec: TransferCodec) {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        sample_tree(src.path());

        let mut wire = Vec::new();
        let sent = codec.encode(src.path(), &mut wire).unwrap();
        let received = codec.decode(wire.as_slice(), dst.path()).unwrap();

        assert_eq!(sent, received);
        assert_eq!(sent.files, 11);
        assert_eq!(sent.dirs, 3);
        assert_eq!(snapshot(src.path()), snapshot(dst.path()));
    }

    #[test]
    fn tar_gzip_roundtrip() {
        roundtrip(TransferCodec::TarGzip);
    }

    #[test]
    fn tar_roundtrip() {
        roundtrip(TransferCodec::Tar);
    }

    #[test]
    fn framed_roundtrip() {
        roundtrip(TransferCodec::Framed);
    }

    #[test]
    fn decoding_twice_overwrites() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        fs::write(dst.path().join("f4.bin"), vec![9u8; 5000]).unwrap();

        for codec in [TransferCodec::TarGzip, TransferCodec::Framed] {
            for _ in 0..2 {
                let mut wire = Vec::new();
                codec.encode(src.path(), &mut wire).unwrap();
                codec.decode(wire.as_slice(), dst.path()).unwrap();
            }
        }
        assert_eq!(snapshot(src.path()), snapshot(dst.path()));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("real"), b"data").unwrap();
        std::os::unix::fs::symlink(src.path().join("real"), src.path().join("link")).unwrap();

        let mut wire = Vec::new();
        let stats = TransferCodec::Tar.encode(src.path(), &mut wire).unwrap();
        assert_eq!(stats.files, 1);
        TransferCodec::Tar.decode(wire.as_slice(), dst.path()).unwrap();
        assert!(dst.path().join("real").exists());
        assert!(!dst.path().join("link").exists());
    }

    #[test]
    fn truncated_tar_is_detected() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("big"), content(4096, 1)).unwrap();

        let mut wire = Vec::new();
        TransferCodec::Tar.encode(src.path(), &mut wire).unwrap();
        // Header block (512) plus part of the content.
        wire.truncate(512 + 1000);
        assert!(matches!(
            TransferCodec::Tar.decode(wire.as_slice(), dst.path()),
            Err(DropError::TruncatedTransfer)
        ));
    }

    #[test]
    fn truncated_framed_is_detected() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("big"), content(4096, 1)).unwrap();

        let mut wire = Vec::new();
        TransferCodec::Framed.encode(src.path(), &mut wire).unwrap();
        let cut = wire.len() - HEADER_FIXED_LEN - 100;
        assert!(matches!(
            TransferCodec::Framed.decode(&wire[..cut], dst.path()),
            Err(DropError::TruncatedTransfer)
        ));
        // Missing done header is also an unfinished transfer.
        let no_done = wire.len() - HEADER_FIXED_LEN;
        assert!(matches!(
            TransferCodec::Framed.decode(&wire[..no_done], dst.path()),
            Err(DropError::TruncatedTransfer)
        ));
    }

    #[test]
    fn clean_tar_eof_at_entry_boundary_is_success() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a"), content(512, 3)).unwrap();

        let mut wire = Vec::new();
        TransferCodec::Tar.encode(src.path(), &mut wire).unwrap();
        // Drop the two zero trailer blocks (and builder padding) after the only entry.
        wire.truncate(1024);
        let stats = TransferCodec::Tar.decode(wire.as_slice(), dst.path()).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(fs::read(dst.path().join("a")).unwrap(), content(512, 3));
    }

    #[test]
    fn tar_entries_keep_their_announced_length() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let grown = src.path().join("grown");
        let shrunk = src.path().join("shrunk");
        fs::write(&grown, content(1000, 1)).unwrap();
        fs::write(&shrunk, content(1000, 2)).unwrap();
        let grown_meta = fs::metadata(&grown).unwrap();
        let shrunk_meta = fs::metadata(&shrunk).unwrap();
        fs::write(&grown, content(3000, 1)).unwrap();
        fs::write(&shrunk, content(10, 2)).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        append_sized(
            &mut builder,
            Path::new("grown"),
            &grown_meta,
            File::open(&grown).unwrap(),
        )
        .unwrap();
        append_sized(
            &mut builder,
            Path::new("shrunk"),
            &shrunk_meta,
            File::open(&shrunk).unwrap(),
        )
        .unwrap();
        builder.append_dir("after", src.path()).unwrap();
        let wire = builder.into_inner().unwrap();

        let stats = TransferCodec::Tar.decode(wire.as_slice(), dst.path()).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 1);
        assert_eq!(fs::read(dst.path().join("grown")).unwrap(), content(1000, 1));
        let mut expected = content(10, 2);
        expected.resize(1000, 0);
        assert_eq!(fs::read(dst.path().join("shrunk")).unwrap(), expected);
        assert!(dst.path().join("after").is_dir());
    }

    #[test]
    fn tar_stays_aligned_while_a_file_grows() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let growing = src.path().join("a_growing.log");
        fs::write(&growing, vec![b'x'; 1 << 20]).unwrap();
        fs::write(src.path().join("b_after.txt"), b"still here").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let appender = {
            let stop = stop.clone();
            let growing = growing.clone();
            std::thread::spawn(move || {
                let mut file = fs::OpenOptions::new().append(true).open(growing).unwrap();
                for _ in 0..256 {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    file.write_all(&[b'y'; 4096]).unwrap();
                    std::thread::sleep(std::time::Duration::from_micros(200));
                }
            })
        };
        let mut wire = Vec::new();
        let sent = TransferCodec::Tar.encode(src.path(), &mut wire);
        stop.store(true, Ordering::Relaxed);
        appender.join().unwrap();
        let sent = sent.unwrap();

        let received = TransferCodec::Tar.decode(wire.as_slice(), dst.path()).unwrap();
        assert_eq!(sent, received);
        assert_eq!(
            fs::read(dst.path().join("b_after.txt")).unwrap(),
            b"still here"
        );
    }

    #[test]
    fn oversized_framed_path_is_refused() {
        let dst = tempfile::tempdir().unwrap();
        let mut wire = EntryHeader::file("x", 0).encode().unwrap();
        wire.truncate(HEADER_FIXED_LEN);
        let len_at = HEADER_FIXED_LEN - drop_core::header::PATH_LEN_FIELD_LEN;
        wire[len_at..].copy_from_slice(b"9999999999");

        assert!(matches!(
            TransferCodec::Framed.decode(wire.as_slice(), dst.path()),
            Err(DropError::Field(_))
        ));
    }

    #[test]
    fn framed_traversal_is_rejected_before_touching_disk() {
        let outer = tempfile::tempdir().unwrap();
        let dst = outer.path().join("dest");
        let mut wire = EntryHeader::file("../escaped", 4).encode().unwrap();
        wire.extend_from_slice(b"evil");
        wire.extend_from_slice(&EntryHeader::done().encode().unwrap());

        assert!(matches!(
            TransferCodec::Framed.decode(wire.as_slice(), &dst),
            Err(DropError::UnsafePath(_))
        ));
        assert!(!outer.path().join("escaped").exists());
    }

    #[test]
    fn tar_traversal_is_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let dst = outer.path().join("dest");

        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        // Bypass the builder's own path checks to forge the entry.
        let name = b"../escaped";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        let mut wire = header.as_bytes().to_vec();
        let mut data = b"evil".to_vec();
        data.resize(512, 0);
        wire.extend_from_slice(&data);
        wire.extend_from_slice(&[0u8; 1024]);

        assert!(matches!(
            TransferCodec::Tar.decode(wire.as_slice(), &dst),
            Err(DropError::UnsafePath(_))
        ));
        assert!(!outer.path().join("escaped").exists());
    }
}
