//! Push server: publishes dispatched events and fans them out to sessions.
//!
//! Every event leaves through [`EventPusher::push_events`]. With a pub/sub
//! backend configured it is published there and comes back through the
//! server's own subscription; without one it goes straight into the local
//! inbox. Either way a single distribution loop decodes it, pre-encodes it
//! once per codec and enqueues it on each eligible session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use http::HeaderMap;
use parking_lot::Mutex;
use tidewire_core::{Encoding, Event, Publication};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::PushConfig;
use super::hook::PushDispatchHook;
use super::registry::SessionRegistry;
use super::session::{PushMessage, PushSession};
use crate::pubsub::{PubSubClient, PubSubError, Unsubscriber};
use crate::service::auth::SessionAuthenticator;
use crate::service::dispatch::EventPusher;

/// Owns the session registry and the distribution loop.
pub struct PushServer {
    config: PushConfig,
    hook: Option<Arc<dyn PushDispatchHook>>,
    authenticators: Vec<Arc<dyn SessionAuthenticator>>,
    registry: Arc<SessionRegistry>,
    pubsub: Option<Arc<dyn PubSubClient>>,
    local: mpsc::Sender<Publication>,
    inbox: Mutex<Option<mpsc::Receiver<Publication>>>,
    shutdown: CancellationToken,
    subscription: Mutex<Option<Unsubscriber>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PushServer {
    #[must_use]
    pub fn new(config: PushConfig) -> Self {
        let (local, inbox) = mpsc::channel(config.publication_buffer.max(1));
        let registry = Arc::new(SessionRegistry::new(
            None,
            Vec::new(),
            config.service_name.clone(),
        ));
        Self {
            config,
            hook: None,
            authenticators: Vec::new(),
            registry,
            pubsub: None,
            local,
            inbox: Mutex::new(Some(inbox)),
            shutdown: CancellationToken::new(),
            subscription: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn PushDispatchHook>) -> Self {
        self.hook = Some(hook);
        self.rebuild_registry();
        self
    }

    /// Appends a session authenticator to the admission chain.
    #[must_use]
    pub fn with_session_authenticator(
        mut self,
        authenticator: Arc<dyn SessionAuthenticator>,
    ) -> Self {
        self.authenticators.push(authenticator);
        self.rebuild_registry();
        self
    }

    /// Routes published events through `pubsub` instead of the local inbox.
    #[must_use]
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSubClient>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    fn rebuild_registry(&mut self) {
        self.registry = Arc::new(SessionRegistry::new(
            self.hook.clone(),
            self.authenticators.clone(),
            self.config.service_name.clone(),
        ));
    }

    #[must_use]
    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Creates an unregistered session using the configured queue capacity.
    #[must_use]
    pub fn new_session(
        &self,
        headers: HeaderMap,
        parameters: std::collections::HashMap<String, Vec<String>>,
    ) -> PushSession {
        PushSession::new(headers, parameters, self.config.session_queue_capacity)
    }

    /// Connects the pub/sub backend, subscribes to the topic and spawns the
    /// distribution loop. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::NotConnected`] if the backend does not connect
    /// within `connect_timeout`.
    pub async fn start(&self) -> Result<(), PubSubError> {
        let Some(inbox) = self.inbox.lock().take() else {
            tracing::debug!("push server already started");
            return Ok(());
        };

        if let Some(pubsub) = &self.pubsub {
            if !pubsub.connect().wait(self.config.connect_timeout).await {
                *self.inbox.lock() = Some(inbox);
                return Err(PubSubError::NotConnected);
            }
            let (errors, mut error_rx) = mpsc::channel::<PubSubError>(16);
            let unsubscriber = pubsub.subscribe(self.local.clone(), errors, &self.config.topic);
            *self.subscription.lock() = Some(unsubscriber);
            tokio::spawn(async move {
                while let Some(err) = error_rx.recv().await {
                    tracing::error!(error = %err, "pub/sub subscription error");
                }
            });
        }

        let worker = tokio::spawn(distribute(
            inbox,
            Arc::clone(&self.registry),
            self.hook.clone(),
            self.shutdown.clone(),
        ));
        *self.worker.lock() = Some(worker);
        tracing::info!(topic = %self.config.topic, "push server started");
        Ok(())
    }

    /// Stops distribution, closes every session and waits for the registry
    /// to drain, at most `drain_timeout`.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        if let Some(pubsub) = &self.pubsub {
            if let Err(err) = pubsub.disconnect().await {
                tracing::warn!(error = %err, "pub/sub disconnect failed");
            }
        }

        self.registry.close_all();
        let drained = self
            .registry
            .wait_until_empty(self.config.drain_poll_interval, self.config.drain_timeout)
            .await;

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "distribution loop failed");
            }
        }
        tracing::info!(drained, "push server stopped");
    }
}

#[async_trait]
impl EventPusher for PushServer {
    async fn push_events(&self, events: Vec<Event>) {
        for event in events {
            let publication = match Publication::from_event(self.config.topic.clone(), &event) {
                Ok(publication) => publication,
                Err(err) => {
                    tracing::warn!(identity = %event.identity(), error = %err, "event not publishable");
                    continue;
                }
            };
            match &self.pubsub {
                Some(pubsub) => {
                    if let Err(err) = pubsub.publish(publication).await {
                        tracing::warn!(identity = %event.identity(), error = %err, "publish failed");
                    }
                }
                None => {
                    if self.local.try_send(publication).is_err() {
                        tracing::warn!(identity = %event.identity(), "publication buffer full, dropping event");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Distribution loop
// ---------------------------------------------------------------------------

async fn distribute(
    mut inbox: mpsc::Receiver<Publication>,
    registry: Arc<SessionRegistry>,
    hook: Option<Arc<dyn PushDispatchHook>>,
    shutdown: CancellationToken,
) {
    loop {
        let publication = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = inbox.recv() => match next {
                Some(publication) => publication,
                None => break,
            },
        };
        deliver(&registry, hook.as_deref(), &publication).await;
    }
    tracing::debug!("distribution loop stopped");
}

/// An event encoded once in every codec.
struct PreEncoded {
    json: Bytes,
    msgpack: Bytes,
}

impl PreEncoded {
    fn new(event: &Event) -> Result<Self, tidewire_core::CodecError> {
        Ok(Self {
            json: Bytes::from(event.encode(Encoding::Json)?),
            msgpack: Bytes::from(event.encode(Encoding::MsgPack)?),
        })
    }

    fn message(&self, encoding: Encoding) -> PushMessage {
        let data = match encoding {
            Encoding::Json => self.json.clone(),
            Encoding::MsgPack => self.msgpack.clone(),
        };
        PushMessage { data, encoding }
    }
}

/// Whether `session` may see `event` before asking the hook.
fn admits(session: &PushSession, event: &Event, related: &[String]) -> bool {
    if session.is_closed() || event.timestamp() < session.start_time() {
        return false;
    }
    let Some(filter) = session.filter() else {
        return true;
    };
    !std::iter::once(event.identity())
        .chain(related.iter().map(String::as_str))
        .any(|identity| filter.is_filtered_out(identity, event.event_type()))
}

async fn deliver(
    registry: &SessionRegistry,
    hook: Option<&dyn PushDispatchHook>,
    publication: &Publication,
) {
    let event = match publication.decode() {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(topic = %publication.topic, error = %err, "dropping undecodable publication");
            return;
        }
    };
    let encoded = match PreEncoded::new(&event) {
        Ok(encoded) => encoded,
        Err(err) => {
            tracing::warn!(identity = %event.identity(), error = %err, "dropping unencodable event");
            return;
        }
    };

    let summary = match hook.map(|hook| hook.summarize_event(&event)).transpose() {
        Ok(summary) => summary.flatten(),
        Err(err) => {
            tracing::warn!(identity = %event.identity(), error = %err, "event summary failed");
            return;
        }
    };
    let related = hook
        .map(|hook| hook.related_identities(event.identity()))
        .unwrap_or_default();

    let sessions: Vec<_> = registry
        .snapshot()
        .into_iter()
        .filter(|session| admits(session, &event, &related))
        .collect();

    let deliveries = sessions.iter().map(|session| {
        let event = &event;
        let encoded = &encoded;
        let summary = summary.as_deref();
        async move {
            let wanted = match hook {
                None => true,
                Some(hook) => match hook.should_dispatch(session, event, summary).await {
                    Ok(wanted) => wanted,
                    Err(err) => {
                        tracing::warn!(session_id = %session.id(), error = %err, "dispatch hook failed");
                        false
                    }
                },
            };
            if wanted {
                session.enqueue(encoded.message(session.write_encoding()));
            }
        }
    });
    join_all(deliveries).await;
}
