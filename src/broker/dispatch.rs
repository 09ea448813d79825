//! Publication dispatch pool
//!
//! A bounded FIFO of posts feeds a fixed set of worker tasks. Readers block
//! on `submit` when the queue is full, which backpressures an overactive
//! publisher without touching other connections. Each worker snapshots the
//! subscriber set outside the table lock and hands the frame to every
//! matching writer queue.
//!
//! With more than one worker the broker only guarantees per-worker
//! ordering: posts from a single publisher are picked up in submission
//! order, but two publishers racing for workers may be observed
//! interleaved. Run a single worker for strict broker-wide FIFO.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::broker::connection::Connection;
use crate::broker::subscriptions::SubscriptionTable;
use crate::protocol::{Packet, Publish};

/// A unit of work for the dispatch pool: one publication and its origin.
pub struct Post {
    pub from: Arc<Connection>,
    pub publish: Publish,
}

/// Handle for submitting publications to the worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    posts: mpsc::Sender<Post>,
}

impl Dispatcher {
    /// Enqueue a post. Blocks while the dispatch FIFO is full.
    pub async fn submit(&self, post: Post) {
        let _ = self.posts.send(post).await;
    }
}

/// Start `workers` dispatch tasks over a FIFO of `capacity` posts.
pub(crate) fn start(
    workers: usize,
    capacity: usize,
    table: Arc<SubscriptionTable>,
) -> Dispatcher {
    let (posts_tx, posts_rx) = mpsc::channel(capacity.max(1));
    let posts_rx = Arc::new(Mutex::new(posts_rx));

    for id in 0..workers.max(1) {
        let posts_rx = posts_rx.clone();
        let table = table.clone();
        tokio::spawn(async move {
            debug!(worker = id, "dispatch worker started");
            loop {
                let post = { posts_rx.lock().await.recv().await };
                match post {
                    Some(post) => deliver(&table, post).await,
                    None => break,
                }
            }
            debug!(worker = id, "dispatch worker stopped");
        });
    }

    Dispatcher { posts: posts_tx }
}

async fn deliver(table: &SubscriptionTable, post: Post) {
    let Post { from, mut publish } = post;

    // Deliveries to clients that were already subscribed when the PUBLISH
    // arrived never carry the retain flag, whatever the publisher set.
    let retain = publish.retain;
    publish.retain = false;

    // Retained publish with an empty payload: clear the slot, deliver
    // nothing.
    if retain && publish.payload.is_empty() {
        table.delete_retained(&publish.topic);
        return;
    }

    let subscribers = table.subscribers(&publish.topic);
    debug!(
        from = %from.client_id(),
        topic = %publish.topic,
        subscribers = subscribers.len(),
        "dispatching publication"
    );
    for conn in subscribers {
        // A false return means the subscriber closed mid-dispatch; the
        // frame is simply dropped for it.
        conn.submit(Packet::Publish(publish.clone())).await;
    }

    if retain {
        table.store_retained(&publish);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::broker::connection::Job;
    use crate::protocol::QoS;

    fn conn_pair() -> (Arc<Connection>, mpsc::Receiver<Job>) {
        Connection::new("127.0.0.1:0".parse().unwrap(), 16)
    }

    fn publish(topic_name: &str, payload: &[u8], retain: bool) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain,
            topic: Arc::from(topic_name),
            message_id: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    async fn next_publish(jobs: &mut mpsc::Receiver<Job>) -> Publish {
        let job = timeout(Duration::from_secs(1), jobs.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("queue closed");
        match job.packet {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_subscriber_with_retain_cleared() {
        let table = Arc::new(SubscriptionTable::new());
        let dispatcher = start(1, 16, table.clone());

        let (sub, mut sub_jobs) = conn_pair();
        let (publisher, _publisher_jobs) = conn_pair();
        table.add("a/b", &sub);

        dispatcher
            .submit(Post {
                from: publisher.clone(),
                publish: publish("a/b", b"hello", true),
            })
            .await;

        let received = next_publish(&mut sub_jobs).await;
        assert_eq!(received.topic.as_ref(), "a/b");
        assert_eq!(received.payload.as_ref(), b"hello");
        assert!(!received.retain, "live delivery must clear the retain flag");

        // The stored copy keeps retain=true for later replay.
        let replayed = table.retained_for("a/b");
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].retain);
    }

    #[tokio::test]
    async fn empty_retained_payload_deletes_without_delivery() {
        let table = Arc::new(SubscriptionTable::new());
        let dispatcher = start(1, 16, table.clone());

        let (sub, mut sub_jobs) = conn_pair();
        let (publisher, _publisher_jobs) = conn_pair();
        table.add("status/device1", &sub);
        table.store_retained(&publish("status/device1", b"on", false));

        dispatcher
            .submit(Post {
                from: publisher.clone(),
                publish: publish("status/device1", b"", true),
            })
            .await;

        // A follow-up publication proves the worker is past the delete and
        // nothing was delivered for the empty payload.
        dispatcher
            .submit(Post {
                from: publisher,
                publish: publish("status/device1", b"next", false),
            })
            .await;

        let received = next_publish(&mut sub_jobs).await;
        assert_eq!(received.payload.as_ref(), b"next");
        assert_eq!(table.retained_len(), 0);
    }

    #[tokio::test]
    async fn single_worker_preserves_submission_order() {
        let table = Arc::new(SubscriptionTable::new());
        let dispatcher = start(1, 16, table.clone());

        let (sub, mut sub_jobs) = conn_pair();
        let (publisher, _publisher_jobs) = conn_pair();
        table.add("seq", &sub);

        for i in 0..5u8 {
            dispatcher
                .submit(Post {
                    from: publisher.clone(),
                    publish: publish("seq", &[i], false),
                })
                .await;
        }

        for i in 0..5u8 {
            let received = next_publish(&mut sub_jobs).await;
            assert_eq!(received.payload.as_ref(), &[i]);
        }
    }
}
