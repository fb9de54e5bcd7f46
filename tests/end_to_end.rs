//! End-to-end scenarios against the public API only (spec.md §8).

use kvault::{Error, Store};

fn temp_path(name: &str) -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("kvault-e2e-{}-{}.kv", std::process::id(), name));
    std::fs::remove_file(&p).ok();
    p
}

#[test]
fn empty_open_reports_not_found_before_and_after_reopen() {
    let path = temp_path("empty");

    let mut store = Store::options().build(&path).unwrap();
    assert!(!store.has(b"x").unwrap());
    assert!(matches!(store.get(b"x"), Err(Error::NotFound)));
    store.close().unwrap();

    let mut store = Store::options().build(&path).unwrap();
    assert!(!store.has(b"x").unwrap());
    assert!(matches!(store.get(b"x"), Err(Error::NotFound)));
    store.close().unwrap();

    std::fs::remove_file(&path).ok();
}

#[test]
fn persistence_survives_close_and_reopen() {
    let path = temp_path("persist");
    let entries: [(&[u8], &[u8]); 6] = [
        (b"foo", b"bar"),
        (b"Mickey", b"Mouse"),
        (b"color", b"blue"),
        (b"z", b"534"),
        (b"height", b"928m"),
        (b"aaa", b"12"),
    ];

    {
        let mut store = Store::options().build(&path).unwrap();
        for (k, v) in entries {
            store.put(k, v, true).unwrap();
        }
        store.close().unwrap();
    }

    let mut store = Store::options().build(&path).unwrap();
    for (k, v) in entries {
        assert_eq!(store.get(k).unwrap(), v);
    }

    let forward: Vec<_> = store.iter().unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(forward.len(), entries.len());

    let mut reverse: Vec<_> = store.iter_rev().unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    reverse.reverse();
    assert_eq!(
        forward.iter().map(|(k, _)| *k.as_bytes()).collect::<Vec<_>>(),
        reverse.iter().map(|(k, _)| *k.as_bytes()).collect::<Vec<_>>()
    );

    store.close().unwrap();
    std::fs::remove_file(&path).ok();
}

#[test]
fn streaming_read_yields_lorem_ipsum_chunks() {
    let path = temp_path("stream");
    let mut store = Store::options().build(&path).unwrap();

    let value = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit sed do eiusmod laborum.";
    store.put(b"longish", value, true).unwrap();

    let mut search = store.find(b"longish").unwrap();
    assert_eq!(store.read_chunk(&mut search, 6).unwrap(), b"Lorem ");
    assert_eq!(store.read_chunk(&mut search, 6).unwrap(), b"ipsum ");
    assert_eq!(store.read_chunk(&mut search, 6).unwrap(), b"dolor ");
    assert_eq!(store.read_chunk(&mut search, 4).unwrap(), b"sit ");
    let rest = store.read_remainder(&mut search).unwrap();
    assert!(rest.ends_with(b"laborum."));

    store.close().unwrap();
    std::fs::remove_file(&path).ok();
}

#[test]
fn idempotent_put_keeps_the_same_value() {
    let path = temp_path("idempotent");
    let mut store = Store::options().build(&path).unwrap();
    store.put(b"k", b"same value", true).unwrap();
    store.put(b"k", b"same value", true).unwrap();
    assert_eq!(store.get(b"k").unwrap(), b"same value");
    store.close().unwrap();
    std::fs::remove_file(&path).ok();
}
