//! WebSocket adapter for the interactive executor.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use codecell_sandbox::{
    start_interactive, InteractiveEvent, InteractiveInput, InteractiveRequest, InteractiveSession,
    OutputKind,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Messages the caller sends over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientMessage {
    #[serde(rename = "execute-interactive")]
    ExecuteInteractive { language: String, code: String },
    #[serde(rename = "input")]
    Input { execution_id: String, data: String },
}

/// Messages the gateway sends over the socket, in wire-protocol order.
///
/// The envelope tag and the stdout/stderr discriminator both want the JSON
/// key `type`, which a single object cannot carry twice. Resolved by letting
/// the tag's value itself carry the distinction: stdout frames serialize
/// `{"type":"output","data":"..."}`, stderr frames `{"type":"stderr","data":
/// "..."}` — there is no separate nested `type` field.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerMessage {
    #[serde(rename = "execution-start")]
    ExecutionStart { execution_id: String },
    #[serde(rename = "output")]
    Output { data: String },
    #[serde(rename = "stderr")]
    StderrOutput { data: String },
    #[serde(rename = "execution-complete")]
    ExecutionComplete { status: &'static str, exit_code: i64, execution_id: String },
    #[serde(rename = "error")]
    Error { message: String },
}

pub async fn interactive_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut session: Option<InteractiveSession> = None;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                    let _ = send_json(&mut sender, &ServerMessage::Error {
                        message: "malformed message".to_string(),
                    }).await;
                    continue;
                };

                match client_msg {
                    ClientMessage::ExecuteInteractive { language, code } => {
                        match start_interactive(
                            &state.queue,
                            state.engine.clone(),
                            state.registry.clone(),
                            InteractiveRequest { language, code },
                        ) {
                            Ok(new_session) => session = Some(new_session),
                            Err(e) => {
                                let _ = send_json(&mut sender, &ServerMessage::Error {
                                    message: e.to_string(),
                                }).await;
                            }
                        }
                    }
                    ClientMessage::Input { execution_id, data } => {
                        if let Some(active) = &session {
                            if let Ok(id) = execution_id.parse() {
                                let _ = active.input_tx.send(InteractiveInput { execution_id: id, data });
                            }
                        }
                    }
                }
            }

            event = next_event(&mut session) => {
                let Some(event) = event else { break };
                let done = matches!(event, InteractiveEvent::Complete { .. });
                if send_json(&mut sender, &to_server_message(event)).await.is_err() {
                    break;
                }
                if done {
                    session = None;
                }
            }
        }
    }
}

/// Waits on the active session's event channel, or never resolves if there
/// is no session yet — keeps the `select!` well-formed while idle.
async fn next_event(session: &mut Option<InteractiveSession>) -> Option<InteractiveEvent> {
    match session {
        Some(active) => active.events_rx.recv().await,
        None => std::future::pending().await,
    }
}

fn to_server_message(event: InteractiveEvent) -> ServerMessage {
    match event {
        InteractiveEvent::Start { id } => ServerMessage::ExecutionStart { execution_id: id.to_string() },
        InteractiveEvent::Output { id: _, kind, data } => {
            let data = String::from_utf8_lossy(&data).into_owned();
            match kind {
                OutputKind::Stdout => ServerMessage::Output { data },
                OutputKind::Stderr => ServerMessage::StderrOutput { data },
            }
        }
        InteractiveEvent::Complete { id, status, exit_code } => ServerMessage::ExecutionComplete {
            status: match status {
                codecell_sandbox::Status::Success => "success",
                codecell_sandbox::Status::Error => "error",
            },
            exit_code,
            execution_id: id.to_string(),
        },
        InteractiveEvent::Error { id: _, message } => ServerMessage::Error { message },
    }
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).expect("server messages always serialize");
    sender.send(Message::Text(json)).await
}
