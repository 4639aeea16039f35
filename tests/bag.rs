use bagpool::bag::{AtomicState, BagEntry, ConcurrentBag, State};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    state: AtomicState,
    held: AtomicBool,
}

impl BagEntry for Slot {
    fn bag_state(&self) -> &AtomicState {
        &self.state
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn borrowers_never_share_an_entry() -> anyhow::Result<()> {
    bagpool_test::setup_if_needed();

    let bag = Arc::new(ConcurrentBag::new(|_waiting: usize| {}));

    for _ in 0..4 {
        bag.add(Arc::new(Slot::default())).await?;
    }

    let violations = Arc::new(AtomicUsize::new(0));
    let borrows = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();

    for _ in 0..32 {
        let bag = bag.clone();
        let violations = violations.clone();
        let borrows = borrows.clone();

        tasks.push(tokio::spawn(async move {
            for _ in 0..200 {
                let Some(slot) = bag.borrow(Duration::from_secs(5)).await else {
                    continue;
                };

                if slot.held.swap(true, Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }

                tokio::task::yield_now().await;

                slot.held.store(false, Ordering::SeqCst);
                borrows.fetch_add(1, Ordering::SeqCst);
                bag.requite(slot).await;
            }
        }));
    }

    for task in tasks {
        task.await?;
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(borrows.load(Ordering::SeqCst) > 0);
    assert_eq!(bag.count(State::NotInUse), 4);
    assert_eq!(bag.waiting_count(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stealing_from_a_waiter_requests_a_replacement() -> anyhow::Result<()> {
    let requests = Arc::new(Mutex::new(Vec::new()));

    let bag = Arc::new(ConcurrentBag::new({
        let requests = requests.clone();
        move |waiting: usize| requests.lock().unwrap().push(waiting)
    }));

    let slot = Arc::new(Slot::default());
    bag.add(slot.clone()).await?;
    let held = bag.borrow(Duration::ZERO).await.expect("free entry");

    // park one borrower on the empty bag
    let parked = tokio::spawn({
        let bag = bag.clone();
        async move { bag.borrow(Duration::from_secs(1)).await.is_some() }
    });

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(bag.waiting_count(), 1);
    assert_eq!(requests.lock().unwrap().as_slice(), &[1]);

    // make the entry free without offering it, then claim it from the shared list
    held.bag_state().store(State::NotInUse);
    let stolen = bag.borrow(Duration::ZERO).await;
    assert!(stolen.is_some());

    assert_eq!(requests.lock().unwrap().last(), Some(&1));
    assert_eq!(requests.lock().unwrap().len(), 2);

    // the parked borrower times out: nothing was returned
    assert!(!parked.await?);
    assert_eq!(bag.waiting_count(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreserve_hands_entry_to_waiter() -> anyhow::Result<()> {
    let bag = Arc::new(ConcurrentBag::new(|_waiting: usize| {}));
    let slot = Arc::new(Slot::default());

    bag.add(slot.clone()).await?;
    assert!(bag.reserve(&slot));
    assert_eq!(bag.count(State::Reserved), 1);

    let waiter = tokio::spawn({
        let bag = bag.clone();
        async move { bag.borrow(Duration::from_secs(1)).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    bag.unreserve(&slot).await;

    let borrowed = waiter.await?.expect("handed over");
    assert!(Arc::ptr_eq(&borrowed, &slot));
    assert_eq!(slot.bag_state().load(), State::InUse);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unbounded_borrow_waits_for_an_entry() -> anyhow::Result<()> {
    let bag = Arc::new(ConcurrentBag::new(|_waiting: usize| {}));

    let waiter = tokio::spawn({
        let bag = bag.clone();
        async move { bag.borrow(Duration::MAX).await }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!waiter.is_finished());

    let slot = Arc::new(Slot::default());
    bag.add(slot.clone()).await?;

    let borrowed = waiter.await?.expect("handed over");
    assert!(Arc::ptr_eq(&borrowed, &slot));

    Ok(())
}

#[tokio::test]
async fn removed_entry_leaves_snapshot() -> anyhow::Result<()> {
    let bag = ConcurrentBag::new(|_waiting: usize| {});
    let first = Arc::new(Slot::default());
    let second = Arc::new(Slot::default());

    bag.add(first.clone()).await?;
    bag.add(second.clone()).await?;

    let borrowed = bag.borrow(Duration::ZERO).await.expect("free entry");
    assert!(bag.remove(&borrowed));
    assert_eq!(borrowed.bag_state().load(), State::Removed);

    let values = bag.values();
    assert_eq!(values.len(), 1);
    assert!(!values.iter().any(|value| Arc::ptr_eq(value, &borrowed)));

    // an entry can only be removed once
    assert!(!bag.remove(&borrowed));

    bag.close();
    assert!(bag.add(Arc::new(Slot::default())).await.is_err());
    assert_eq!(bag.len(), 1);

    Ok(())
}
