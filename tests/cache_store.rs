use std::collections::BTreeSet;
use std::sync::Arc;

use booksync::cache::{CacheInit, CacheStore, CachedChapter, LocalFsCacheStore};
use booksync::model::{ChapterIdentity, ChapterStatus};

fn chapter(index: u32, status: ChapterStatus) -> CachedChapter {
    CachedChapter::new(
        ChapterIdentity::Index(index),
        index,
        status,
        format!("<p>chapter {index}</p>"),
    )
}

async fn initialized_store(temp: &tempfile::TempDir) -> anyhow::Result<LocalFsCacheStore> {
    let store = LocalFsCacheStore::new(temp.path().join("book-1"));
    assert!(!store.exists().await);
    store
        .initialize(CacheInit::new("book-1", "0011223344556677").with_title("Book One"))
        .await?;
    assert!(store.exists().await);
    Ok(store)
}

#[tokio::test]
async fn chapter_sets_stay_disjoint_across_retries() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = initialized_store(&temp).await?;

    store.save_chapter(&chapter(0, ChapterStatus::Failed)).await?;
    store.save_chapter(&chapter(1, ChapterStatus::Failed)).await?;
    store.save_chapter(&chapter(0, ChapterStatus::Downloaded)).await?;

    let manifest = store.load_manifest().await.expect("manifest");
    assert_eq!(
        manifest.cached_chapter_ids,
        BTreeSet::from([ChapterIdentity::Index(0)])
    );
    assert_eq!(
        manifest.failed_chapter_ids,
        BTreeSet::from([ChapterIdentity::Index(1)])
    );
    assert_eq!(manifest.title.as_deref(), Some("Book One"));
    assert!(manifest.updated_at >= manifest.created_at);

    let state = store.snapshot().await.expect("snapshot");
    assert!(state.is_valid("0011223344556677"));
    assert!(!state.is_valid("ffffffffffffffff"));
    assert!(state.is_cached(&ChapterIdentity::Index(0)));
    assert!(state.is_failed(&ChapterIdentity::Index(1)));
    Ok(())
}

#[tokio::test]
async fn locked_chapters_leave_the_failed_set() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = initialized_store(&temp).await?;

    store.save_chapter(&chapter(2, ChapterStatus::Failed)).await?;
    store.save_chapter(&chapter(2, ChapterStatus::Locked)).await?;
    store.save_chapter(&chapter(3, ChapterStatus::Volume)).await?;

    let state = store.snapshot().await.expect("snapshot");
    assert!(state.is_locked(&ChapterIdentity::Index(2)));
    assert!(!state.is_failed(&ChapterIdentity::Index(2)));
    assert!(state.is_cached(&ChapterIdentity::Index(3)));
    Ok(())
}

#[tokio::test]
async fn contract_violations_are_errors() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;

    let uninitialized = LocalFsCacheStore::new(temp.path().join("missing"));
    assert!(
        uninitialized
            .save_chapter(&chapter(0, ChapterStatus::Downloaded))
            .await
            .is_err()
    );

    let store = initialized_store(&temp).await?;
    assert!(store.save_chapter(&chapter(0, ChapterStatus::Pending)).await.is_err());

    store.save_chapter(&chapter(0, ChapterStatus::Downloaded)).await?;
    assert!(store.save_chapter(&chapter(0, ChapterStatus::Failed)).await.is_err());

    let state = store.snapshot().await.expect("snapshot");
    assert!(state.is_cached(&ChapterIdentity::Index(0)));
    assert!(state.failed.is_empty());

    assert!(store.save_image("../escape.png", b"x").await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_lose_no_updates() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = Arc::new(initialized_store(&temp).await?);

    let mut handles = Vec::new();
    for index in 0..40_u32 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let status = if index % 4 == 0 {
                ChapterStatus::Failed
            } else {
                ChapterStatus::Downloaded
            };
            store.save_chapter(&chapter(index, status)).await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let manifest = store.load_manifest().await.expect("manifest");
    assert_eq!(manifest.cached_chapter_ids.len(), 30);
    assert_eq!(manifest.failed_chapter_ids.len(), 10);
    assert!(
        manifest
            .cached_chapter_ids
            .is_disjoint(&manifest.failed_chapter_ids)
    );

    let chapters = store.load_all_chapters().await;
    assert_eq!(chapters.len(), 40);
    let orders: Vec<u32> = chapters.iter().map(|c| c.order).collect();
    assert_eq!(orders, (0..40).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn corrupt_manifest_loads_as_absent() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = initialized_store(&temp).await?;
    std::fs::write(store.root().join("manifest.json"), b"{ not json")?;

    assert!(store.exists().await);
    assert!(store.load_manifest().await.is_none());
    assert!(store.snapshot().await.is_none());
    assert!(store.save_chapter(&chapter(0, ChapterStatus::Downloaded)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn chapters_round_trip_and_unreadable_files_are_skipped() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = initialized_store(&temp).await?;

    let failed = CachedChapter::new(ChapterIdentity::id("c/9"), 9, ChapterStatus::Failed, "")
        .with_title("Nine")
        .with_fail_reason("HTTP 502");
    store.save_chapter(&failed).await?;
    std::fs::write(store.root().join("chapters").join("broken.json"), b"[")?;

    let loaded = store
        .load_chapter(&ChapterIdentity::id("c/9"))
        .await
        .expect("chapter");
    assert_eq!(loaded, failed);
    assert!(store.load_chapter(&ChapterIdentity::id("nope")).await.is_none());
    assert_eq!(store.load_all_chapters().await, vec![failed]);
    Ok(())
}

#[tokio::test]
async fn images_are_stored_byte_for_byte() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = initialized_store(&temp).await?;

    let png: Vec<u8> = (0..=255).collect();
    store.save_image("b.png", &png).await?;
    store.save_image("a.jpg", b"jpeg").await?;

    assert!(store.image_exists("b.png").await);
    assert!(!store.image_exists("c.png").await);
    assert_eq!(store.load_image("b.png").await, Some(png));
    assert_eq!(store.load_image("c.png").await, None);
    assert_eq!(store.list_image_ids().await, vec!["a.jpg", "b.png"]);
    Ok(())
}

#[tokio::test]
async fn cleanup_removes_the_root_and_tolerates_repeats() -> anyhow::Result<()> {
    let temp = tempfile::TempDir::new()?;
    let store = initialized_store(&temp).await?;
    store.save_chapter(&chapter(0, ChapterStatus::Downloaded)).await?;

    store.cleanup().await;
    assert!(!store.exists().await);
    assert!(!store.root().exists());
    store.cleanup().await;
    Ok(())
}
