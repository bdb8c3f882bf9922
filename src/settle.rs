//! Write-once settlement cell shared by [`Promise`](crate::Promise) and
//! [`RequestFuture`](crate::RequestFuture).
//!
//! Continuations registered with [`SettleCell::on_settle`] run synchronously
//! inside [`SettleCell::settle`], in registration order, before any task
//! awaiting the cell is woken. State objects rely on this: by the time an
//! awaiter observes the outcome, every state built on the cell has already
//! been finalized.

use parking_lot::Mutex;
use tokio::sync::watch;

type Continuation<O> = Box<dyn FnOnce(&O) + Send>;

struct Inner<O> {
    outcome: Option<O>,
    continuations: Vec<Continuation<O>>,
}

pub(crate) struct SettleCell<O> {
    inner: Mutex<Inner<O>>,
    /// Flips to `true` after all continuations ran.
    settled: watch::Sender<bool>,
}

impl<O: Clone> SettleCell<O> {
    pub fn new() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner {
                outcome: None,
                continuations: Vec::new(),
            }),
            settled,
        }
    }

    /// The outcome, if settled.
    pub fn peek(&self) -> Option<O> {
        self.inner.lock().outcome.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    /// Settle with `outcome`. Returns `false` if already settled.
    pub fn settle(&self, outcome: O) -> bool {
        let continuations = {
            let mut inner = self.inner.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.continuations)
        };
        for continuation in continuations {
            continuation(&outcome);
        }
        self.settled.send_replace(true);
        true
    }

    /// Run `f` once the cell settles, or right away if it already has.
    pub fn on_settle(&self, f: impl FnOnce(&O) + Send + 'static) {
        let outcome = {
            let mut inner = self.inner.lock();
            match &inner.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    inner.continuations.push(Box::new(f));
                    return;
                }
            }
        };
        f(&outcome);
    }

    /// Wait until settled and all continuations ran.
    pub async fn wait(&self) -> O {
        let mut rx = self.settled.subscribe();
        loop {
            if *rx.borrow_and_update() {
                if let Some(outcome) = self.peek() {
                    return outcome;
                }
            }
            // The sender lives in `self`, so the channel cannot close here.
            let _ = rx.changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn continuations_run_in_order_once() {
        let cell = SettleCell::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            cell.on_settle(move |v| seen.lock().push(format!("{tag}{v}")));
        }

        assert!(cell.settle(1));
        assert!(!cell.settle(2));
        assert_eq!(cell.peek(), Some(1));

        let late = seen.clone();
        cell.on_settle(move |v| late.lock().push(format!("late{v}")));

        assert_eq!(*seen.lock(), vec!["a1", "b1", "late1"]);
    }

    #[tokio::test]
    async fn wait_returns_after_settle() {
        let cell = Arc::new(SettleCell::<&'static str>::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        tokio::task::yield_now().await;
        cell.settle("done");
        assert_eq!(waiter.await.unwrap(), "done");
        assert_eq!(cell.wait().await, "done");
    }
}
