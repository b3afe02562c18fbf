//! Integration tests for the track catalog upsert and lookups

mod test_helpers;

use listenledger_core::{MergePolicy, TrackCatalog, TrackColumn, TrackFields};
use test_helpers::*;

#[tokio::test]
async fn test_upsert_returns_stable_id() {
    let db = TestDb::new().await;

    let first = db.ledger.upsert(&sample_track("subsonic:track:1")).await.unwrap();
    let second = db.ledger.upsert(&sample_track("subsonic:track:1")).await.unwrap();
    let other = db.ledger.upsert(&sample_track("subsonic:track:2")).await.unwrap();

    assert_eq!(first, second);
    assert_ne!(first, other);
}

#[tokio::test]
async fn test_merge_fills_gaps_and_refreshes_volatile_fields() {
    let db = TestDb::new().await;

    let mut initial = TrackFields::new("subsonic:track:42", "A", "Artist");
    initial.album = Some("Album".to_string());
    let id = db.ledger.upsert(&initial).await.unwrap();

    let mut update = TrackFields::new("subsonic:track:42", "B", "Artist");
    update.year = Some(2020);
    db.ledger.upsert(&update).await.unwrap();

    let stored = db.ledger.get_track(id).await.unwrap().expect("track exists");
    assert_eq!(stored.fields.title, "B");
    assert_eq!(stored.fields.year, Some(2020));
    assert_eq!(stored.fields.album.as_deref(), Some("Album"));
}

#[tokio::test]
async fn test_null_never_overwrites_known_value() {
    let db = TestDb::new().await;

    let mut initial = sample_track("spotify:track:abc");
    initial.image_url = Some("https://img/1.jpg".to_string());
    initial.genre = Some("Trip Hop".to_string());
    let id = db.ledger.upsert(&initial).await.unwrap();

    db.ledger.upsert(&sample_track("spotify:track:abc")).await.unwrap();

    let stored = db.ledger.get_track(id).await.unwrap().unwrap();
    assert_eq!(stored.fields.image_url.as_deref(), Some("https://img/1.jpg"));
    assert_eq!(stored.fields.genre.as_deref(), Some("Trip Hop"));
}

#[tokio::test]
async fn test_stable_fields_keep_first_known_value() {
    let db = TestDb::new().await;

    let mut initial = sample_track("subsonic:track:7");
    initial.year = Some(1998);
    let id = db.ledger.upsert(&initial).await.unwrap();

    let mut update = sample_track("subsonic:track:7");
    update.year = Some(2006);
    db.ledger.upsert(&update).await.unwrap();

    let stored = db.ledger.get_track(id).await.unwrap().unwrap();
    assert_eq!(stored.fields.year, Some(1998));
}

#[tokio::test]
async fn test_custom_policy_makes_year_volatile() {
    let db = TestDb::with_policy(&MergePolicy {
        volatile_fields: vec![TrackColumn::Year],
    })
    .await;

    let mut initial = sample_track("subsonic:track:7");
    initial.year = Some(1998);
    let id = db.ledger.upsert(&initial).await.unwrap();

    let mut update = TrackFields::new("subsonic:track:7", "Renamed", "Massive Attack");
    update.year = Some(2006);
    db.ledger.upsert(&update).await.unwrap();

    let stored = db.ledger.get_track(id).await.unwrap().unwrap();
    assert_eq!(stored.fields.year, Some(2006));
    assert_eq!(stored.fields.title, "Teardrop");
}

#[tokio::test]
async fn test_concurrent_upserts_converge_on_one_row() {
    let db = TestDb::new().await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let ledger = db.ledger.clone();
        handles.push(tokio::spawn(async move {
            let mut fields = sample_track("listenbrainz:massive-attack:teardrop");
            if i % 2 == 0 {
                fields.year = Some(1998);
            } else {
                fields.album = Some("Mezzanine".to_string());
            }
            ledger.upsert(&fields).await.unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let stored = db.ledger.get_track(ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.fields.year, Some(1998));
    assert_eq!(stored.fields.album.as_deref(), Some("Mezzanine"));
}

#[tokio::test]
async fn test_lookup_by_vendor_id_and_artist_title() {
    let db = TestDb::new().await;

    let id = db.ledger.upsert(&sample_track("subsonic:track:9")).await.unwrap();

    let by_vendor = db
        .ledger
        .get_track_by_vendor_id("subsonic:track:9")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_vendor.id, id);

    let by_name = db
        .ledger
        .find_by_artist_title("massive attack", "TEARDROP")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_name.id, id);

    assert!(db.ledger.get_track_by_vendor_id("nope").await.unwrap().is_none());
    assert!(db.ledger.get_track(9999).await.unwrap().is_none());
}
