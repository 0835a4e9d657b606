//! Sizing and archiving behaviour on real directory trees.

use chrono::NaiveDate;
use distpack::archive::{ArchiveMethod, ArchiveWriter, NoProgress};
use distpack::config::{Environment, PackConfig};
use distpack::ledger::{MemoryStore, VersionLedger};
use distpack::publish::{Naming, PublishOptions, PublishState, Publisher};
use distpack::size::SizeWalker;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

// ---------- helpers ----------

/// Builds `depth` levels of `width` directories, each holding a few files.
fn build_tree(dir: &Path, depth: usize, width: usize, file_bytes: &mut u64) {
    for f in 0..3 {
        let len = (f + 1) * 37 + depth;
        fs::write(dir.join(format!("file_{f}.dat")), vec![f as u8; len]).unwrap();
        *file_bytes += len as u64;
    }
    if depth == 0 {
        return;
    }
    for w in 0..width {
        let sub = dir.join(format!("dir_{w}"));
        fs::create_dir(&sub).unwrap();
        build_tree(&sub, depth - 1, width, file_bytes);
    }
}

fn dir_metadata_total(dir: &Path) -> u64 {
    let mut total = fs::symlink_metadata(dir).unwrap().len();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if fs::symlink_metadata(&path).unwrap().is_dir() {
            total += dir_metadata_total(&path);
        }
    }
    total
}

fn listing(archive: &Path) -> Vec<(String, u64)> {
    let mut zip = zip::ZipArchive::new(fs::File::open(archive).unwrap()).unwrap();
    (0..zip.len())
        .map(|i| {
            let f = zip.by_index(i).unwrap();
            (f.name().to_string(), f.size())
        })
        .collect()
}

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Nests `depth` directories named `component` below `base`, going through
/// directory descriptors so the full path may exceed `PATH_MAX`.
#[cfg(target_os = "linux")]
fn build_overlong_chain(base: &Path, component: &str, depth: usize) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let base = CString::new(base.as_os_str().as_bytes()).unwrap();
    let name = CString::new(component).unwrap();
    unsafe {
        let mut fd = libc::open(base.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY);
        assert!(fd >= 0);
        for _ in 0..depth {
            assert_eq!(libc::mkdirat(fd, name.as_ptr(), 0o755), 0);
            let next = libc::openat(fd, name.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY);
            assert!(next >= 0);
            libc::close(fd);
            fd = next;
        }
        libc::close(fd);
    }
}

// ---------- tests ----------

#[tokio::test]
async fn total_is_independent_of_fan_out() {
    let dir = tempdir().unwrap();
    let mut file_bytes = 0;
    build_tree(dir.path(), 3, 3, &mut file_bytes);
    let expected = file_bytes + dir_metadata_total(dir.path());

    for fan_out in [1, 2, 4, 16] {
        let result = SizeWalker::new(fan_out).compute_size(dir.path()).await.unwrap();
        assert_eq!(result.total_bytes, expected, "fan_out = {fan_out}");
        assert!(result.errors.is_empty());
    }
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_directory_is_skipped_not_fatal() {
    use std::os::unix::fs::PermissionsExt;

    if running_as_root() {
        eprintln!("skipping: permission checks do not apply to root");
        return;
    }

    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
    let locked = dir.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::write(locked.join("hidden.txt"), vec![0u8; 500]).unwrap();
    let locked_size = fs::symlink_metadata(&locked).unwrap().len();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

    let result = SizeWalker::new(4).compute_size(dir.path()).await;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    let result = result.unwrap();

    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].path, locked);
    let root_size = fs::symlink_metadata(dir.path()).unwrap().len();
    assert_eq!(result.total_bytes, root_size + 10 + locked_size);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn entry_that_cannot_be_stated_is_skipped_not_fatal() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
    let deep = dir.path().join("deep");
    fs::create_dir(&deep).unwrap();
    // 25 components of 200 bytes push the absolute path past PATH_MAX.
    build_overlong_chain(&deep, &"d".repeat(200), 25);

    let result = SizeWalker::new(4).compute_size(dir.path()).await.unwrap();

    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].cause.raw_os_error(), Some(libc::ENAMETOOLONG));
    assert!(result.errors[0].path.starts_with(&deep));
    let visible = fs::symlink_metadata(dir.path()).unwrap().len()
        + 10
        + fs::symlink_metadata(&deep).unwrap().len();
    assert!(result.total_bytes > visible);
}

#[cfg(unix)]
#[tokio::test]
async fn listable_root_is_required_before_any_output() {
    use std::os::unix::fs::PermissionsExt;

    if running_as_root() {
        eprintln!("skipping: permission checks do not apply to root");
        return;
    }

    let project = tempdir().unwrap();
    let dist = project.path().join("dist");
    fs::create_dir(&dist).unwrap();
    fs::write(dist.join("a.txt"), b"hello").unwrap();
    let out = project.path().join("out");
    fs::create_dir(&out).unwrap();
    fs::set_permissions(&dist, fs::Permissions::from_mode(0o311)).unwrap();

    let options = PublishOptions {
        source_dir: dist.clone(),
        output_dir: out.clone(),
        environment: Environment::Test,
        method: ArchiveMethod::Deflate,
        fan_out: 2,
        sequential: false,
        today: NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
    };
    let mut publisher = Publisher::new(
        options,
        Naming::Counter(PackConfig::default()),
        VersionLedger::new(MemoryStore::new()),
    );
    let result = publisher.run().await;
    fs::set_permissions(&dist, fs::Permissions::from_mode(0o755)).unwrap();

    let err = result.unwrap_err();
    assert!(matches!(err, distpack::PackError::RootUnreadable { .. }), "{err:?}");
    assert_eq!(publisher.state(), PublishState::Failed);
    assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_file_aborts_archiving() {
    use std::os::unix::fs::PermissionsExt;

    if running_as_root() {
        eprintln!("skipping: permission checks do not apply to root");
        return;
    }

    let src = tempdir().unwrap();
    let secret = src.path().join("secret.txt");
    fs::write(&secret, b"top secret").unwrap();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
    let out = tempdir().unwrap();
    let dest = out.path().join("x.zip");

    let err = ArchiveWriter::new(ArchiveMethod::Deflate)
        .write_to_file(src.path(), &dest, &mut NoProgress)
        .unwrap_err();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o644)).unwrap();

    assert!(matches!(err, distpack::PackError::ArchiveIo { .. }));
    assert!(!dest.exists());
}

#[test]
fn archives_of_an_unchanged_tree_match() {
    let src = tempdir().unwrap();
    let mut file_bytes = 0;
    build_tree(src.path(), 2, 2, &mut file_bytes);
    let out = tempdir().unwrap();

    let first = out.path().join("first.zip");
    let second = out.path().join("second.zip");
    let writer = ArchiveWriter::new(ArchiveMethod::Deflate);
    writer.write_to_file(src.path(), &first, &mut NoProgress).unwrap();
    writer.write_to_file(src.path(), &second, &mut NoProgress).unwrap();

    let a = listing(&first);
    assert_eq!(a, listing(&second));
    assert_eq!(a.iter().map(|(_, size)| size).sum::<u64>(), file_bytes);
    let mut sorted = a.clone();
    sorted.sort();
    assert_eq!(a, sorted);
}
