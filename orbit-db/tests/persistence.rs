use std::{path::Path, sync::Arc};

use anyhow::Result;
use orbit_base::Identity;
use orbit_db::{Config, Error, Event, MemHub, OpenOptions, OrbitDb};
use orbit_oplog::store::fs;
use serde_json::json;

/// A node keeping both blobs and local state under `dir`, with no peers.
async fn node(dir: &Path, seed: &[u8]) -> Result<OrbitDb> {
    let identity = Identity::new(&mut orbit_test::test_rng(seed));
    let store = fs::Store::persistent(dir.join("blobs")).await?;
    let pubsub = MemHub::new().node(identity.public_key());
    let config = Config {
        directory: dir.join("state"),
        ..Default::default()
    };
    Ok(OrbitDb::new(
        Arc::new(identity),
        Arc::new(store),
        Arc::new(pubsub),
        config,
    ))
}

fn local() -> OpenOptions {
    OpenOptions::default().sync(false)
}

#[tokio::test]
async fn reopen_without_network() -> Result<()> {
    let _guard = orbit_test::logging::setup();
    let dir = tempfile::tempdir()?;

    let address = {
        let orbit = node(dir.path(), b"persist").await?;
        let log = orbit.eventlog("persistence", local()).await?;
        log.add("hello1").await?;
        log.add("hello2").await?;
        log.close().await?;
        log.address().to_string()
    };

    let orbit = node(dir.path(), b"persist").await?;
    let log = orbit.eventlog(&address, local().local_only(true)).await?;
    assert!(log.iterator(None).is_empty());
    let mut events = log.subscribe();
    assert_eq!(log.load(None).await?, 2);

    let values: Vec<_> = log.iterator(None).into_iter().map(|i| i.value).collect();
    assert_eq!(values, vec![json!("hello1"), json!("hello2")]);
    assert!(matches!(events.try_recv()?.event, Event::Load { loaded: 2 }));
    assert!(matches!(events.try_recv()?.event, Event::Ready));

    // the limit counts from the newest entry
    let newest = log.iterator(Some(1));
    assert_eq!(newest.len(), 1);
    assert_eq!(newest[0].value, json!("hello2"));
    Ok(())
}

#[tokio::test]
async fn load_in_steps() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let address = {
        let orbit = node(dir.path(), b"steps").await?;
        let log = orbit.eventlog("steps", local()).await?;
        for i in 0..3 {
            log.add(i).await?;
        }
        log.close().await?;
        log.address().to_string()
    };

    let orbit = node(dir.path(), b"steps").await?;
    let log = orbit.eventlog(&address, local()).await?;
    assert_eq!(log.load(Some(1)).await?, 1);
    let values: Vec<_> = log.iterator(None).into_iter().map(|i| i.value).collect();
    assert_eq!(values, vec![json!(2)]);
    assert_eq!(log.log().tails().len(), 1);

    assert_eq!(log.load_more(Some(1)).await?, 1);
    assert_eq!(log.load_more(None).await?, 1);
    let values: Vec<_> = log.iterator(None).into_iter().map(|i| i.value).collect();
    assert_eq!(values, vec![json!(0), json!(1), json!(2)]);
    assert!(log.log().tails().is_empty());
    Ok(())
}

#[tokio::test]
async fn typed_stores_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (kv, docs, counter, feed) = {
        let orbit = node(dir.path(), b"typed").await?;

        let kv = orbit.kvstore("kv", local()).await?;
        kv.put("a", 1).await?;
        kv.set("b", json!({"x": true})).await?;
        kv.put("a", 2).await?;
        kv.put("c", "gone").await?;
        kv.del("c").await?;
        assert_eq!(kv.get("a"), Some(json!(2)));

        let docs = orbit.docstore("docs", local()).await?;
        docs.put(json!({"_id": "hello", "views": 1})).await?;
        docs.put(json!({"_id": "world", "views": 10})).await?;
        docs.put(json!({"_id": "hello", "views": 2})).await?;
        assert!(docs.put(json!({"name": "no key"})).await.is_err());
        let err = docs.del("missing").await.unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert_eq!(err.to_string(), "No entry with key 'missing' in the database");

        let counter = orbit.counter("counter", local()).await?;
        counter.inc(1).await?;
        assert_eq!(counter.inc(2).await?, 3);

        let feed = orbit.feed("feed", local()).await?;
        let first = feed.add("first").await?;
        feed.add("second").await?;
        feed.remove(first).await?;
        assert!(feed.get(&first).is_none());

        let addresses = (
            kv.address().to_string(),
            docs.address().to_string(),
            counter.address().to_string(),
            feed.address().to_string(),
        );
        kv.close().await?;
        docs.close().await?;
        counter.close().await?;
        feed.close().await?;
        addresses
    };

    let orbit = node(dir.path(), b"typed").await?;

    let kv_db = orbit.kvstore(&kv, local()).await?;
    kv_db.load(None).await?;
    let all = kv_db.all();
    assert_eq!(all.len(), 2);
    assert_eq!(all["a"], json!(2));
    assert_eq!(all["b"], json!({"x": true}));

    let docs_db = orbit.docstore(&docs, local()).await?;
    docs_db.load(None).await?;
    assert_eq!(docs_db.get("hello"), Some(json!({"_id": "hello", "views": 2})));
    let popular = docs_db.query(|doc| doc["views"].as_u64().unwrap_or(0) > 5);
    assert_eq!(popular, vec![json!({"_id": "world", "views": 10})]);
    docs_db.del("world").await?;
    assert!(docs_db.get("world").is_none());

    let counter_db = orbit.counter(&counter, local()).await?;
    counter_db.load(None).await?;
    assert_eq!(counter_db.value(), 3);
    assert_eq!(counter_db.inc(4).await?, 7);

    let feed_db = orbit.feed(&feed, local()).await?;
    feed_db.load(None).await?;
    let values: Vec<_> = feed_db.iterator(None).into_iter().map(|i| i.value).collect();
    assert_eq!(values, vec![json!("second")]);
    Ok(())
}
