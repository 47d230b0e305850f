use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
};

use pretty_assertions::assert_eq;
use temp_dir::TempDir;

use super::{assert_ids, consume, feed, non_reliable_options, nv_registry, reliable_options, started_queue};
use crate::qdisk::RESERVED;

const MIB: u64 = 1024 * 1024;

#[test]
fn corrupt_length_prefix_restarts_the_file() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&reliable_options(dir.path(), MIB, 0), &registry);

    feed(&queue, &registry, 0, 3, 100);
    let path = queue.filename().unwrap();
    queue.save_queue().unwrap();

    // Valid header, garbage length prefix at the read head.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(RESERVED)).unwrap();
    file.write_all(&u32::MAX.to_le_bytes()).unwrap();
    drop(file);

    queue.load_queue(Some(&path)).unwrap();
    assert_eq!(queue.len(), 3);

    // The pop detects the corruption, renames the file aside and starts
    // an empty one under the same path.
    assert!(queue.pop_head().is_none());
    assert_eq!(queue.len(), 0);

    let mut corrupted = path.clone().into_os_string();
    corrupted.push(".corrupted");
    assert!(std::path::PathBuf::from(corrupted).exists());
    assert_eq!(queue.filename().unwrap(), path);

    // The fresh file accepts pushes again.
    feed(&queue, &registry, 10, 2, 100);
    let popped = consume(&queue, 2);
    assert_ids(&popped, 10..12);
    queue.ack_backlog(2);
}

#[test]
fn corrupt_record_body_restarts_the_file() {
    let dir = TempDir::new().unwrap();
    let registry = nv_registry();
    let queue = started_queue(&non_reliable_options(dir.path(), MIB, 64, 100), &registry);

    // Push enough that records land on disk past the fast path.
    feed(&queue, &registry, 0, 100, 100);
    let path = queue.filename().unwrap();
    queue.save_queue().unwrap();

    // Mangle the version byte of the first on-disk record.
    let mut file = OpenOptions::new().write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(RESERVED + 4)).unwrap();
    file.write_all(&[0xfd]).unwrap();
    drop(file);

    queue.load_queue(Some(&path)).unwrap();
    // The restored fast-path records still pop fine.  Draining them makes
    // the background refill read the mangled record from disk, which
    // restarts the whole file.
    let fast = consume(&queue, 64);
    assert_ids(&fast, 0..64);

    assert!(queue.pop_head().is_none());
    assert_eq!(queue.len(), 0);

    let mut corrupted = path.clone().into_os_string();
    corrupted.push(".corrupted");
    assert!(std::path::PathBuf::from(corrupted).exists());

    feed(&queue, &registry, 200, 1, 100);
    assert_eq!(consume(&queue, 1)[0].rcpt_id, 200);
    queue.ack_backlog(65);
}
