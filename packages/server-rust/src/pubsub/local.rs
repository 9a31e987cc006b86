//! In-process pub/sub backend.
//!
//! One coordinator task owns the topic to subscribers map. Subscriptions and
//! publications reach it over channels, so the map is never shared and no
//! lock is held while forwarding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tidewire_core::Publication;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::{PubSubClient, PubSubError, Unsubscriber, Waiter};

enum Registration {
    Subscribe {
        id: u64,
        topic: String,
        pubs: mpsc::Sender<Publication>,
    },
    Unsubscribe {
        id: u64,
    },
}

type Inboxes = (
    mpsc::Receiver<Publication>,
    mpsc::UnboundedReceiver<Registration>,
);

/// Pub/sub backend delivering publications within the current process.
pub struct LocalPubSub {
    publications: mpsc::Sender<Publication>,
    registrations: mpsc::UnboundedSender<Registration>,
    inboxes: Mutex<Option<Inboxes>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    stop: CancellationToken,
}

impl LocalPubSub {
    /// Creates a backend buffering up to `buffer` publications.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        let (publications, publications_rx) = mpsc::channel(buffer.max(1));
        let (registrations, registrations_rx) = mpsc::unbounded_channel();
        Self {
            publications,
            registrations,
            inboxes: Mutex::new(Some((publications_rx, registrations_rx))),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            stop: CancellationToken::new(),
        }
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl PubSubClient for LocalPubSub {
    async fn publish(&self, publication: Publication) -> Result<(), PubSubError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(PubSubError::NotConnected);
        }
        let topic = publication.topic.clone();
        self.publications
            .send(publication)
            .await
            .map_err(|_| PubSubError::Publish {
                topic,
                reason: "coordinator stopped".to_string(),
            })
    }

    fn subscribe(
        &self,
        pubs: mpsc::Sender<Publication>,
        _errors: mpsc::Sender<PubSubError>,
        topic: &str,
    ) -> Unsubscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.registrations.send(Registration::Subscribe {
            id,
            topic: topic.to_string(),
            pubs,
        });
        let registrations = self.registrations.clone();
        Unsubscriber::new(move || {
            let _ = registrations.send(Registration::Unsubscribe { id });
        })
    }

    /// Starts the coordinator on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    fn connect(&self) -> Waiter {
        if let Some((publications, registrations)) = self.inboxes.lock().take() {
            tokio::spawn(coordinate(publications, registrations, self.stop.clone()));
            self.connected.store(true, Ordering::Release);
        }
        Waiter::resolved(self.connected.load(Ordering::Acquire))
    }

    async fn disconnect(&self) -> Result<(), PubSubError> {
        self.connected.store(false, Ordering::Release);
        self.stop.cancel();
        Ok(())
    }
}

async fn coordinate(
    mut publications: mpsc::Receiver<Publication>,
    mut registrations: mpsc::UnboundedReceiver<Registration>,
    stop: CancellationToken,
) {
    let mut subscribers: HashMap<String, Vec<(u64, mpsc::Sender<Publication>)>> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            Some(registration) = registrations.recv() => match registration {
                Registration::Subscribe { id, topic, pubs } => {
                    subscribers.entry(topic).or_default().push((id, pubs));
                }
                Registration::Unsubscribe { id } => {
                    subscribers.retain(|_, list| {
                        list.retain(|(sub_id, _)| *sub_id != id);
                        !list.is_empty()
                    });
                }
            },
            Some(publication) = publications.recv() => {
                let Some(list) = subscribers.get_mut(&publication.topic) else {
                    continue;
                };
                list.retain(|(_, pubs)| !pubs.is_closed());
                for (id, pubs) in list.iter() {
                    if let Err(TrySendError::Full(_)) = pubs.try_send(publication.clone()) {
                        tracing::warn!(
                            subscriber = id,
                            topic = %publication.topic,
                            "subscriber full, dropping publication"
                        );
                    }
                }
            }
            else => break,
        }
    }
    tracing::debug!("local pub/sub coordinator stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn publication(topic: &str, byte: u8) -> Publication {
        Publication {
            topic: topic.to_string(),
            data: vec![byte],
            encoding: tidewire_core::Encoding::MsgPack,
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Publication>) -> Option<Publication> {
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_requires_connect() {
        let backend = LocalPubSub::new(8);
        assert_eq!(
            backend.publish(publication("events", 1)).await,
            Err(PubSubError::NotConnected)
        );
        assert!(backend.connect().wait(Duration::from_millis(10)).await);
        assert!(backend.publish(publication("events", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn fans_out_to_topic_subscribers_only() {
        let backend = LocalPubSub::new(8);
        let (errors, _errors_rx) = mpsc::channel(1);
        let (a, mut a_rx) = mpsc::channel(8);
        let (b, mut b_rx) = mpsc::channel(8);
        let (other, mut other_rx) = mpsc::channel(8);
        let _ua = backend.subscribe(a, errors.clone(), "events");
        let _ub = backend.subscribe(b, errors.clone(), "events");
        let _uo = backend.subscribe(other, errors, "audit");
        backend.connect();

        backend.publish(publication("events", 7)).await.unwrap();
        assert_eq!(recv(&mut a_rx).await.unwrap().data, [7]);
        assert_eq!(recv(&mut b_rx).await.unwrap().data, [7]);
        assert!(recv(&mut other_rx).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let backend = LocalPubSub::new(8);
        let (errors, _errors_rx) = mpsc::channel(1);
        let (tx, mut rx) = mpsc::channel(8);
        let unsubscriber = backend.subscribe(tx, errors, "events");
        backend.connect();

        backend.publish(publication("events", 1)).await.unwrap();
        assert!(recv(&mut rx).await.is_some());

        unsubscriber.unsubscribe();
        backend.publish(publication("events", 2)).await.unwrap();
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn disconnect_rejects_further_publications() {
        let backend = LocalPubSub::new(8);
        backend.connect();
        backend.disconnect().await.unwrap();
        assert_eq!(
            backend.publish(publication("events", 1)).await,
            Err(PubSubError::NotConnected)
        );
    }
}
