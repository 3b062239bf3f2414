use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::error::ActionError;
use crate::messages::{ClientMessage, ServerMessage, SystemStatus};
use crate::orchestrator::Orchestrator;
use crate::talker::Link;

type ClientId = usize;

/// WebSocket server in front of the orchestrator
///
/// Workflows run one at a time; the orchestrator mutex is held for the whole
/// workflow. Status requests never wait on it.
pub struct WebSocketServer<S> {
    addr: SocketAddr,
    orchestrator: Arc<Mutex<Orchestrator<S>>>,
    clients: Arc<Mutex<HashMap<ClientId, broadcast::Sender<String>>>>,
    next_client_id: Arc<Mutex<ClientId>>,
}

impl<S: Link + 'static> WebSocketServer<S> {
    pub fn new(addr: SocketAddr, orchestrator: Arc<Mutex<Orchestrator<S>>>) -> Self {
        Self {
            addr,
            orchestrator,
            clients: Arc::new(Mutex::new(HashMap::new())),
            next_client_id: Arc::new(Mutex::new(0)),
        }
    }

    /// Serve until `shutdown` resolves
    ///
    /// Connection and broadcast tasks live in a `JoinSet`; on shutdown they
    /// are aborted and awaited, so no task still holds the orchestrator
    /// once this returns.
    pub async fn start(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("WebSocket server listening on {}", self.addr);

        let mut tasks = JoinSet::new();
        self.start_status_broadcaster(&mut tasks);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let server = self.clone();
                        tasks.spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                tracing::error!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                },
                // Reap finished connections
                Some(_) = tasks.join_next() => {}
            }
        }

        tasks.shutdown().await;
        tracing::info!("WebSocket server stopped");
        Ok(())
    }

    /// Push a status message to every client whenever the snapshot changes
    fn start_status_broadcaster(&self, tasks: &mut JoinSet<()>) {
        let server = self.clone();

        tasks.spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            let mut last_broadcast: Option<(bool, Option<SystemStatus>)> = None;

            loop {
                ticker.tick().await;

                let snapshot = server.snapshot();
                if last_broadcast.as_ref() == Some(&snapshot) {
                    continue;
                }

                let message = ServerMessage::Status {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    busy: snapshot.0,
                    system: snapshot.1.clone(),
                };

                if let Ok(json) = serde_json::to_string(&message) {
                    let clients_lock = server.clients.lock().await;
                    for (client_id, tx) in clients_lock.iter() {
                        if let Err(e) = tx.send(json.clone()) {
                            tracing::debug!("Failed to broadcast to client {}: {}", client_id, e);
                        }
                    }
                }

                last_broadcast = Some(snapshot);
            }
        });
    }

    /// Handle a new client connection
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        tracing::info!("New connection from {}", peer_addr);

        let ws_stream = accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let client_id = self.register_client().await;
        tracing::info!("Client {} registered from {}", client_id, peer_addr);

        let msg = serde_json::to_string(&self.collect_status())?;
        let _ = write.send(Message::Text(msg)).await;

        let mut rx = {
            let clients = self.clients.lock().await;
            clients
                .get(&client_id)
                .context("Client vanished from registry")?
                .subscribe()
        };

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let response = match self.handle_message(&text).await {
                                Ok(resp) => resp,
                                Err(e) => {
                                    tracing::warn!("Invalid message from client {}: {}", client_id, e);
                                    ServerMessage::Error {
                                        message: format!("Invalid command: {}", e),
                                    }
                                }
                            };

                            let response_json = serde_json::to_string(&response)?;
                            write.send(Message::Text(response_json)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("Client {} disconnected", client_id);
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error from client {}: {}", client_id, e);
                            break;
                        }
                        _ => {}
                    }
                }
                Ok(broadcast_msg) = rx.recv() => {
                    if let Err(e) = write.send(Message::Text(broadcast_msg)).await {
                        tracing::error!("Failed to send broadcast to client {}: {}", client_id, e);
                        break;
                    }
                }
            }
        }

        self.unregister_client(client_id).await;
        tracing::info!("Client {} unregistered", client_id);

        Ok(())
    }

    async fn register_client(&self) -> ClientId {
        let mut next_id = self.next_client_id.lock().await;
        let client_id = *next_id;
        *next_id += 1;

        let (tx, _) = broadcast::channel(100);
        self.clients.lock().await.insert(client_id, tx);

        client_id
    }

    async fn unregister_client(&self, client_id: ClientId) {
        self.clients.lock().await.remove(&client_id);
    }

    /// Handle a client message
    ///
    /// Only malformed JSON is an `Err`; workflow failures come back as
    /// `ServerMessage::Error`.
    pub(crate) async fn handle_message(&self, text: &str) -> Result<ServerMessage> {
        let message: ClientMessage = serde_json::from_str(text)?;

        let (command, result) = match message {
            ClientMessage::Home => {
                let result = self.orchestrator.lock().await.home_state().await;
                ("home", result.map(|()| "Gantry homed, stations undocked".to_string()))
            }
            ClientMessage::Move { location } => {
                let result = self.orchestrator.lock().await.move_gantry_to(&location).await;
                ("move", result.map(|()| format!("Gantry docked at {}", location)))
            }
            ClientMessage::SetSlot { slot } => {
                let result = self.orchestrator.lock().await.set_slot(slot);
                ("set_slot", result.map(|()| format!("Active slot set to {}", slot)))
            }
            ClientMessage::LoadGantry { amount_secs, speed } => {
                let result = self
                    .orchestrator
                    .lock()
                    .await
                    .load_gantry_with_filament(amount_secs, speed)
                    .await;
                ("load_gantry", result.map(|()| "Gantry loaded with filament".to_string()))
            }
            ClientMessage::LoadPrinter => {
                let result = self
                    .orchestrator
                    .lock()
                    .await
                    .load_printer_with_filament()
                    .await;
                ("load_printer", result.map(|()| "Printer loaded with filament".to_string()))
            }
            ClientMessage::Status => return Ok(self.collect_status()),
            ClientMessage::Noop => ("noop", Ok(String::new())),
        };

        Ok(Self::reply(command, result))
    }

    fn reply(command: &str, result: Result<String, ActionError>) -> ServerMessage {
        match result {
            Ok(message) => ServerMessage::Response {
                success: true,
                command: command.to_string(),
                message,
            },
            Err(e) => ServerMessage::Error {
                message: format!("Failed to {}: {}", command, e),
            },
        }
    }

    /// `(busy, status)`; status is `None` while a workflow holds the devices
    fn snapshot(&self) -> (bool, Option<SystemStatus>) {
        match self.orchestrator.try_lock() {
            Ok(orchestrator) => (false, Some(orchestrator.status())),
            Err(_) => (true, None),
        }
    }

    fn collect_status(&self) -> ServerMessage {
        let (busy, system) = self.snapshot();
        ServerMessage::Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            busy,
            system,
        }
    }
}

impl<S> Clone for WebSocketServer<S> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            orchestrator: self.orchestrator.clone(),
            clients: self.clients.clone(),
            next_client_id: self.next_client_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowConfig;
    use crate::fake_device::{Exchange, FakeDevice};
    use crate::messages::Position;
    use crate::storage::FilamentSlot;
    use tokio::io::DuplexStream;

    fn server(
        gantry: Vec<Exchange>,
        storage: Vec<Exchange>,
    ) -> (WebSocketServer<DuplexStream>, FakeDevice, FakeDevice) {
        let (gantry_link, gantry) = FakeDevice::spawn("gantry", gantry);
        let (storage_link, storage) = FakeDevice::spawn("storage", storage);
        let (spool_link, _spool) = FakeDevice::spawn("printer_spool", vec![]);

        let orchestrator = Orchestrator::new(
            gantry_link,
            storage_link,
            spool_link,
            WorkflowConfig::default(),
        )
        .unwrap();
        let addr = "127.0.0.1:0".parse().unwrap();

        (
            WebSocketServer::new(addr, Arc::new(Mutex::new(orchestrator))),
            gantry,
            storage,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_slot_then_status() {
        let (server, _gantry, _storage) = server(vec![], vec![]);

        let reply = server
            .handle_message(r#"{"type": "set_slot", "slot": 3}"#)
            .await
            .unwrap();
        assert!(matches!(reply, ServerMessage::Response { success: true, ref command, .. } if command == "set_slot"));

        let ServerMessage::Status { busy, system, .. } =
            server.handle_message(r#"{"type": "status"}"#).await.unwrap()
        else {
            panic!("expected status");
        };
        assert!(!busy);
        let system = system.unwrap();
        assert_eq!(system.storage.active_slot, FilamentSlot::Three);
        assert_eq!(system.gantry.position, Position::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_slot_is_an_error_reply() {
        let (server, _gantry, _storage) = server(vec![], vec![]);

        let reply = server
            .handle_message(r#"{"type": "set_slot", "slot": 9}"#)
            .await
            .unwrap();

        assert!(matches!(reply, ServerMessage::Error { ref message } if message.contains("between 1 and 4")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_is_rejected() {
        let (server, _gantry, _storage) = server(vec![], vec![]);

        assert!(server.handle_message(r#"{"type": "dance"}"#).await.is_err());
        assert!(server.handle_message("not json").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_runs_workflow() {
        let (server, gantry, storage) = server(
            vec![
                Exchange::new("home()").reply("Home Success"),
                Exchange::new("move_left(1)").reply("Movement Successful"),
            ],
            vec![Exchange::new("dock()").reply("Dock successful.")],
        );

        let reply = server
            .handle_message(r#"{"type": "move", "location": "storage_1"}"#)
            .await
            .unwrap();

        assert!(matches!(reply, ServerMessage::Response { success: true, .. }));
        assert_eq!(gantry.commands(), vec!["home()", "move_left(1)"]);
        assert_eq!(storage.commands(), vec!["dock()"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_to_unknown_location_is_an_error_reply() {
        let (server, gantry, _storage) = server(vec![], vec![]);

        let reply = server
            .handle_message(r#"{"type": "move", "location": "printer_9"}"#)
            .await
            .unwrap();

        assert!(matches!(reply, ServerMessage::Error { ref message } if message.contains("printer_9")));
        assert!(gantry.commands().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_orchestrator() {
        let (server, _gantry, _storage) = server(vec![], vec![]);
        let orchestrator = server.orchestrator.clone();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = tokio::spawn(Arc::new(server).start(async move {
            let _ = shutdown_rx.await;
        }));
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(Arc::try_unwrap(orchestrator).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_busy_while_workflow_runs() {
        let (server, _gantry, _storage) = server(vec![], vec![]);

        let _guard = server.orchestrator.lock().await;
        let ServerMessage::Status { busy, system, .. } =
            server.handle_message(r#"{"type": "status"}"#).await.unwrap()
        else {
            panic!("expected status");
        };

        assert!(busy);
        assert!(system.is_none());
    }
}
