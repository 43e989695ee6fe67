//! Tests applying record changes through update strategies

use sluice::test_utilities::{self, cities, cities_index};
use sluice::{Conf, Error, Registry, StrategyKind, StrategyStack, is};

/// Build a client with a `cities` index holding some records
fn client(count: usize) -> Result<(sluice::Sluice, std::sync::Arc<sluice::backends::Memory>), Error> {
    let registry = Registry::new().with(cities_index(cities(count)?))?;
    Ok(test_utilities::memory_sluice(Conf::default(), registry))
}

#[tokio::test]
async fn base_refuses_updates() -> Result<(), Error> {
    let (sluice, _) = client(1)?;
    let stack = sluice.strategies();
    is!(stack.current()?, StrategyKind::Base);
    match stack.update("cities#city", &["1"]).await {
        Err(Error::UndefinedUpdateStrategy(target)) => is!(target, "cities#city"),
        other => return Err(Error::new(format!("Base strategy allowed an update: {other:?}"))),
    }
    Ok(())
}

#[tokio::test]
async fn root_cannot_be_popped() -> Result<(), Error> {
    let (sluice, _) = client(1)?;
    let stack = sluice.strategies();
    match stack.pop().await {
        Err(Error::RootStrategyPop) => (),
        other => return Err(Error::new(format!("Popped the root strategy: {other:?}"))),
    }
    is!(stack.depth()?, 1);
    Ok(())
}

#[tokio::test]
async fn wrap_pops_after_errors() -> Result<(), Error> {
    let (sluice, memory) = client(2)?;
    let stack = sluice.strategies();
    let before = memory.bulk_requests();
    let inner = stack.clone();
    let result: Result<(), Error> = stack
        .wrap(StrategyKind::Bypass, || async move {
            is!(inner.current()?, StrategyKind::Bypass);
            inner.update("cities", &["1", "2"]).await?;
            Err(Error::new("work failed"))
        })
        .await;
    match result {
        Err(error) => is!(error.msg(), Some("work failed".to_owned())),
        Ok(()) => return Err(Error::new("Wrapped work should have failed")),
    }
    is!(stack.depth()?, 1);
    is!(stack.current()?, StrategyKind::Base);
    // bypassed updates are never imported
    is!(memory.bulk_requests(), before);
    Ok(())
}

#[tokio::test]
async fn urgent_imports_immediately() -> Result<(), Error> {
    let (sluice, memory) = client(3)?;
    let stack = sluice.strategies();
    let guard = stack.push(StrategyKind::Urgent)?;
    stack.update("cities#city", &["2"]).await?;
    is!(memory.document("cities", "city", "2")?.is_some(), true);
    is!(memory.document("cities", "city", "1")?.is_none(), true);
    let released = guard.release().await?;
    is!(released, StrategyKind::Urgent);
    is!(stack.depth()?, 1);
    Ok(())
}

#[tokio::test]
async fn atomic_imports_once_on_release() -> Result<(), Error> {
    let (sluice, memory) = client(3)?;
    let stack = sluice.strategies();
    let guard = stack.push_named("atomic")?;
    stack.update("cities#city", &["1", "2"]).await?;
    stack.update("cities", &["2", "3"]).await?;
    // nothing is imported until the strategy is left
    is!(memory.bulk_requests(), 0);
    is!(memory.index_names()?.is_empty(), true);
    let released = guard.release().await?;
    is!(released, StrategyKind::Atomic);
    is!(memory.bulk_requests(), 1);
    for id in ["1", "2", "3"] {
        is!(memory.document("cities", "city", id)?.is_some(), true);
    }
    Ok(())
}

#[tokio::test]
async fn nested_strategies_unwind() -> Result<(), Error> {
    let (sluice, memory) = client(2)?;
    let stack = sluice.strategies();
    let outer = stack.push(StrategyKind::Atomic)?;
    stack.update("cities#city", &["1"]).await?;
    let inner = stack.push(StrategyKind::Bypass)?;
    is!(stack.depth()?, 3);
    stack.update("cities#city", &["2"]).await?;
    inner.release().await?;
    is!(stack.current()?, StrategyKind::Atomic);
    outer.release().await?;
    is!(memory.document("cities", "city", "1")?.is_some(), true);
    is!(memory.document("cities", "city", "2")?.is_none(), true);
    Ok(())
}

#[tokio::test]
async fn dropped_guards_pop() -> Result<(), Error> {
    let (sluice, memory) = client(2)?;
    let stack = sluice.strategies();
    {
        let _guard = stack.push(StrategyKind::Atomic)?;
        stack.update("cities#city", &["1"]).await?;
        is!(stack.depth()?, 2);
    }
    is!(stack.depth()?, 1);
    // the pending import is flushed in the background
    for _ in 0..50 {
        if matches!(memory.document("cities", "city", "1"), Ok(Some(_))) {
            break;
        }
        tokio::task::yield_now().await;
    }
    is!(memory.document("cities", "city", "1")?.is_some(), true);
    Ok(())
}

#[tokio::test]
async fn unknown_strategies() -> Result<(), Error> {
    let (sluice, _) = client(1)?;
    match sluice.strategies().push_named("eventual") {
        Err(Error::UnknownStrategy(name)) => is!(name, "eventual"),
        Err(error) => return Err(error),
        Ok(_) => return Err(Error::new("Pushed an unknown strategy")),
    }
    Ok(())
}

#[tokio::test]
async fn request_stack() -> Result<(), Error> {
    let mut conf = Conf::default();
    conf.strategies.request = StrategyKind::Urgent;
    let registry = Registry::new().with(cities_index(cities(1)?))?;
    let (sluice, memory) = test_utilities::memory_sluice(conf, registry);
    let stack = sluice.request_strategies()?;
    is!(stack.depth()?, 2);
    is!(stack.current()?, StrategyKind::Urgent);
    stack.update("cities#city", &["1"]).await?;
    is!(memory.document("cities", "city", "1")?.is_some(), true);
    let released = stack.release().await?;
    is!(released, StrategyKind::Urgent);
    Ok(())
}

#[tokio::test]
async fn request_stack_flushes_on_release() -> Result<(), Error> {
    let (sluice, memory) = client(3)?;
    let stack = sluice.request_strategies()?;
    is!(stack.current()?, StrategyKind::Atomic);
    stack.update("cities#city", &["1", "2"]).await?;
    is!(memory.document("cities", "city", "1")?.is_none(), true);
    let root = StrategyStack::clone(&stack);
    let released = stack.release().await?;
    is!(released, StrategyKind::Atomic);
    is!(root.depth()?, 1);
    for id in ["1", "2"] {
        is!(memory.document("cities", "city", id)?.is_some(), true);
    }
    is!(memory.document("cities", "city", "3")?.is_none(), true);
    Ok(())
}

#[tokio::test]
async fn dropped_request_stack_flushes() -> Result<(), Error> {
    let (sluice, memory) = client(3)?;
    {
        let stack = sluice.request_strategies()?;
        stack.update("cities#city", &["1", "2"]).await?;
    }
    // dropped stacks flush in the background
    for _ in 0..100 {
        if matches!(memory.document("cities", "city", "2"), Ok(Some(_))) {
            break;
        }
        tokio::task::yield_now().await;
    }
    for id in ["1", "2"] {
        is!(memory.document("cities", "city", id)?.is_some(), true);
    }
    Ok(())
}

#[tokio::test]
async fn wrap_request_flushes_after_work() -> Result<(), Error> {
    let (sluice, memory) = client(2)?;
    let depth = sluice
        .wrap_request(|stack| async move {
            stack.update("cities#city", &["2"]).await?;
            stack.depth()
        })
        .await?;
    is!(depth, 2);
    is!(memory.document("cities", "city", "2")?.is_some(), true);
    // the request strategy is popped even when the work fails
    let failed = sluice
        .wrap_request(|stack| async move {
            stack.update("cities#city", &["1"]).await?;
            Err::<(), Error>(Error::new("request failed"))
        })
        .await;
    is!(failed.is_err(), true);
    is!(memory.document("cities", "city", "1")?.is_some(), true);
    Ok(())
}

#[tokio::test]
async fn queued_updates_are_drained() -> Result<(), Error> {
    let (sluice, memory) = client(3)?;
    // queued updates need a queue
    let unqueued = sluice.strategies();
    let guard = unqueued.push(StrategyKind::Queued)?;
    is!(unqueued.update("cities#city", &["1"]).await.is_err(), true);
    guard.release().await?;
    let (sluice, worker) = sluice.with_update_queue(10);
    let stack = sluice.strategies();
    let guard = stack.push(StrategyKind::Queued)?;
    stack.update("cities#city", &["1", "3"]).await?;
    stack.update("cities#city", &["2"]).await?;
    guard.release().await?;
    is!(memory.bulk_requests(), 0);
    is!(worker.drain().await?, 2);
    for id in ["1", "2", "3"] {
        is!(memory.document("cities", "city", id)?.is_some(), true);
    }
    is!(worker.drain().await?, 0);
    Ok(())
}
