//! Drives the real axum server: an HTTP create reaches connected WebSocket
//! sessions as a push event, in each session's negotiated encoding.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tidewire_core::{ApiError, Encoding, Entity, Event, EventType, Identity, ModelRegistry};
use tidewire_server::service::{Context, CreateProcessor};
use tidewire_server::{
    build_dispatch_pipeline, Dispatcher, NetworkConfig, NetworkModule, Processor,
    ProcessorRegistry, PushConfig, PushServer, ServerConfig,
};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Note {
    id: String,
    text: String,
}

fn note_identity() -> Identity {
    Identity::new("note", "notes")
}

impl Entity for Note {
    fn identity(&self) -> Identity {
        note_identity()
    }

    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn validate(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

struct Notes;

#[async_trait]
impl CreateProcessor for Notes {
    async fn process_create(&self, ctx: &mut Context) -> anyhow::Result<()> {
        let note = ctx
            .input::<Note>()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing note"))?;
        ctx.set_output_entity(note);
        Ok(())
    }
}

impl Processor for Notes {
    fn as_create(&self) -> Option<&dyn CreateProcessor> {
        Some(self)
    }
}

struct Running {
    port: u16,
    stop: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn spawn_server() -> Running {
    let models = Arc::new(ModelRegistry::new().register::<Note>(note_identity()));
    let processors = Arc::new(ProcessorRegistry::new());
    processors.register(&note_identity(), Arc::new(Notes)).unwrap();

    let push = Arc::new(PushServer::new(PushConfig::default()));
    let dispatcher = Dispatcher::new(ServerConfig::default(), models.clone(), processors)
        .with_event_pusher(push.clone());
    let pipeline = build_dispatch_pipeline(Arc::new(dispatcher), None);

    let config = NetworkConfig {
        host: "127.0.0.1".to_string(),
        ..NetworkConfig::default()
    };
    let mut module = NetworkModule::new(config, pipeline, models, push);
    let port = module.start().await.unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(module.serve(async move {
        let _ = stopped.await;
    }));
    Running { port, stop, server }
}

async fn post(port: u16, path: &str, body: &'static str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap()
}

async fn wait_for_sessions(port: u16, expected: u64) {
    let url = format!("http://127.0.0.1:{port}/health");
    for _ in 0..100 {
        let health: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        if health["push_sessions"].as_u64() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("push sessions never reached {expected}");
}

async fn next_message<S>(socket: &mut S) -> Message
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("push message in time")
        .expect("socket open")
        .expect("valid frame")
}

#[tokio::test]
async fn http_create_is_pushed_to_websocket_sessions() {
    let running = spawn_server().await;
    let base = format!("ws://127.0.0.1:{}/events", running.port);

    let (mut json_socket, _) = tokio_tungstenite::connect_async(base.as_str()).await.unwrap();
    let (mut msgpack_socket, _) =
        tokio_tungstenite::connect_async(format!("{base}?encoding=msgpack"))
            .await
            .unwrap();
    wait_for_sessions(running.port, 2).await;

    let response = post(running.port, "/notes", r#"{"id":"n1","text":"hi"}"#).await;
    assert_eq!(response.status(), 201);

    let frame = next_message(&mut json_socket).await;
    assert!(frame.is_text());
    let event = Event::decode(&frame.into_data(), Encoding::Json).unwrap();
    assert_eq!(event.event_type(), EventType::Create);
    assert_eq!(event.identity(), "note");
    assert_eq!(event.decode_entity::<Note>().unwrap().text, "hi");

    let frame = next_message(&mut msgpack_socket).await;
    assert!(frame.is_binary());
    let event = Event::decode(&frame.into_data(), Encoding::MsgPack).unwrap();
    assert_eq!(event.decode_entity::<Note>().unwrap().id, "n1");

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn rejected_create_pushes_nothing() {
    let running = spawn_server().await;
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/events", running.port))
            .await
            .unwrap();
    wait_for_sessions(running.port, 1).await;

    let response = post(running.port, "/notes", "not json").await;
    assert_eq!(response.status(), 400);
    let errors: Vec<ApiError> = response.json().await.unwrap();
    assert!(errors[0].description.starts_with("malformed JSON"));

    let nothing = tokio::time::timeout(Duration::from_millis(200), socket.next()).await;
    assert!(nothing.is_err(), "no event expected for a failed create");

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();
}
