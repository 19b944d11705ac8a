//! Token lifecycle across concurrent holders.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{now_epoch, ResourceError};
use strata_tokens::{column, token_entity, ConsumeRequest, TokenSpec};
use strata_test_utils::assertions::assert_resource_code;
use strata_test_utils::fixtures::memory_token_service;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    let (_tiers, service) = memory_token_service();
    service.create(vec![TokenSpec::new("shared", "")]).await;
    let service = Arc::new(service);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.acquire(&["shared"]).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_claim) => winners += 1,
            Err(e) => assert!(matches!(e, ResourceError::LockContention { .. }), "{e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_interleaved_acquire_with_join() {
    let (_tiers, service) = memory_token_service();
    service
        .create(vec![TokenSpec::new("a", ""), TokenSpec::new("b", "")])
        .await;

    let (first, second) = tokio::join!(service.acquire(&["a", "b"]), service.acquire(&["b", "a"]));
    assert!(first.is_ok() ^ second.is_ok());

    // The loser rolled back; only the winner's locks remain.
    let winner = first.or(second).unwrap();
    service.release(winner).await.unwrap();
    let claim = service.acquire(&["a", "b"]).await.unwrap();
    assert_eq!(claim.token_ids().len(), 2);
}

#[tokio::test]
async fn test_consume_all_uses_deletes_token() {
    let (tiers, service) = memory_token_service();
    service
        .create(vec![TokenSpec::new("pass", "enter").with_uses(3)])
        .await;

    let results = service
        .use_tokens(&[ConsumeRequest::new("pass", "enter", 3)])
        .await;
    let outcome = results[0].1.as_ref().unwrap();
    assert_eq!(outcome.remaining, 0);
    assert!(outcome.deleted);
    assert_eq!(tiers.store.row_count(&token_entity().table), 0);

    let again = service
        .use_tokens(&[ConsumeRequest::new("pass", "enter", 1)])
        .await;
    assert!(again[0].1.is_err());
}

#[tokio::test]
async fn test_overdraw_leaves_token_untouched() {
    let (tiers, service) = memory_token_service();
    service
        .create(vec![TokenSpec::new("pass", "enter").with_uses(2)])
        .await;
    let entity = token_entity();
    let before = tiers
        .store
        .row(&entity, &strata_core::KeyTuple::single("pass"))
        .unwrap();

    let results = service
        .use_tokens(&[ConsumeRequest::new("pass", "enter", 3)])
        .await;
    assert_resource_code(&results[0].1, "insufficient_uses");

    let after = tiers
        .store
        .row(&entity, &strata_core::KeyTuple::single("pass"))
        .unwrap();
    assert_eq!(before[column::USES], after[column::USES]);
    assert!(after[column::LOCK].is_null());
}

#[tokio::test]
async fn test_two_use_token_with_short_ttl() {
    let (_tiers, service) = memory_token_service();
    let created = service
        .create(vec![TokenSpec::new("invite", "signup|login")
            .with_uses(2)
            .with_ttl(Duration::from_secs(60))])
        .await;
    assert_eq!(created[0].as_ref().unwrap(), "invite");

    let tokens = service.get(&["invite"]).await.unwrap();
    let token = tokens[0].1.as_ref().unwrap();
    assert_eq!(token.uses, 2);
    assert!(token.expires_at > now_epoch() + 50);
    assert!(token.expires_at <= now_epoch() + 60);

    let wrong = service
        .use_tokens(&[ConsumeRequest::new("invite", "signupx", 1)])
        .await;
    assert_resource_code(&wrong[0].1, "scope_mismatch");

    let first = service
        .use_tokens(&[ConsumeRequest::new("invite", "signup", 1)])
        .await;
    assert_eq!(first[0].1.as_ref().unwrap().remaining, 1);

    let tokens = service.get(&["invite"]).await.unwrap();
    assert_eq!(tokens[0].1.as_ref().unwrap().uses, 1);

    let second = service
        .use_tokens(&[ConsumeRequest::new("invite", "login", 1)])
        .await;
    assert!(second[0].1.as_ref().unwrap().deleted);

    let gone = service.get(&["invite"]).await.unwrap();
    assert_resource_code(&gone[0].1, "not_found");
}

#[tokio::test]
async fn test_claim_blocks_other_consumers_until_release() {
    let (_tiers, service) = memory_token_service();
    service
        .create(vec![TokenSpec::new("t", "").with_uses(5)])
        .await;

    let claim = service.acquire(&["t"]).await.unwrap();
    let blocked = service
        .use_tokens(&[ConsumeRequest::new("t", "anything", 1)])
        .await;
    assert_resource_code(&blocked[0].1, "lock_contention");

    let own = service
        .consume(&claim, &[ConsumeRequest::new("t", "anything", 1)])
        .await;
    assert_eq!(own[0].1.as_ref().unwrap().remaining, 4);
    service.release(claim).await.unwrap();

    let after = service
        .use_tokens(&[ConsumeRequest::new("t", "anything", 1)])
        .await;
    assert_eq!(after[0].1.as_ref().unwrap().remaining, 3);
}

#[tokio::test]
async fn test_overdraw_after_partial_use_keeps_remainder() {
    let (_tiers, service) = memory_token_service();
    service
        .create(vec![TokenSpec::new("pair", "")
            .with_uses(2)
            .with_ttl(Duration::from_secs(60))])
        .await;

    let first = service
        .use_tokens(&[ConsumeRequest::new("pair", "x", 1)])
        .await;
    assert_eq!(first[0].1.as_ref().unwrap().remaining, 1);

    let second = service
        .use_tokens(&[ConsumeRequest::new("pair", "x", 2)])
        .await;
    match &second[0].1 {
        Err(ResourceError::InsufficientResource {
            remaining,
            requested,
            ..
        }) => {
            assert_eq!(*remaining, 1);
            assert_eq!(*requested, 2);
        }
        other => panic!("expected insufficient uses, got {other:?}"),
    }

    let tokens = service.get(&["pair"]).await.unwrap();
    assert_eq!(tokens[0].1.as_ref().unwrap().uses, 1);
}
