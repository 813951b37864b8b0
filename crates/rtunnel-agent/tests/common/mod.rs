//! Loopback transport for agent tests
//!
//! Listeners are real TCP listeners on this machine, so "the relay host" is
//! localhost. Remote commands are interpreted just enough to emulate the
//! reaper's find-and-kill command against simulated stale processes.

#![allow(dead_code)]

use async_trait::async_trait;
use rtunnel_transport::{
    BindAddress, CommandOutput, ControlSession, PeerInfo, RemoteListener, TransportError,
    TransportResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// How the loopback relay answers remote commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBehavior {
    /// Kill simulated holders of the port named in the command
    Emulate,
    /// Like `Emulate`, but with dash's wording when there is nothing to kill
    EmulateDash,
    /// The relay has no `lsof`; the default command bails out with 127
    LsofMissing,
}

/// A port held by a simulated stale process on the relay
#[derive(Debug)]
struct StaleHolder {
    pid: u32,
    _socket: std::net::TcpListener,
}

#[derive(Debug)]
pub struct LoopbackSession {
    closed: watch::Sender<bool>,
    holders: Mutex<HashMap<u16, StaleHolder>>,
    commands: Mutex<Vec<String>>,
    behavior: CommandBehavior,
}

impl LoopbackSession {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(CommandBehavior::Emulate)
    }

    pub fn with_behavior(behavior: CommandBehavior) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            closed,
            holders: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            behavior,
        })
    }

    /// Bind `port` on behalf of a stale process with the given pid
    pub fn hold_port(&self, port: u16, pid: u32) {
        let socket = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        self.holders.lock().unwrap().insert(
            port,
            StaleHolder {
                pid,
                _socket: socket,
            },
        );
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlSession for LoopbackSession {
    type Listener = LoopbackListener;

    async fn run_command(&self, command: &str) -> TransportResult<CommandOutput> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        self.commands.lock().unwrap().push(command.to_string());

        if self.behavior == CommandBehavior::LsofMissing {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "lsof: not found\n".to_string(),
                exit_status: Some(127),
            });
        }

        let mut holders = self.holders.lock().unwrap();
        let port = holders
            .keys()
            .copied()
            .find(|port| command.contains(&format!("tcp:{}", port)));

        Ok(match port.and_then(|port| holders.remove(&port)) {
            Some(holder) => CommandOutput {
                stdout: format!("{}\n", holder.pid),
                stderr: String::new(),
                exit_status: Some(0),
            },
            None if self.behavior == CommandBehavior::EmulateDash => CommandOutput {
                stdout: "\n".to_string(),
                stderr: "dash: 1: kill: Usage: kill [-s sigspec | -signum | -sigspec] [pid | job]... or\nkill -l [exitstatus]\n".to_string(),
                exit_status: Some(2),
            },
            None => CommandOutput {
                stdout: "\n".to_string(),
                stderr: "kill: not enough arguments\n".to_string(),
                exit_status: Some(1),
            },
        })
    }

    async fn listen(&self, addr: &BindAddress) -> TransportResult<Self::Listener> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let socket = TcpListener::bind((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| TransportError::ListenDenied {
                address: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local = socket.local_addr()?;

        Ok(LoopbackListener {
            addr: BindAddress::new(local.ip().to_string(), local.port()),
            socket: Some(socket),
            closed: self.closed.subscribe(),
        })
    }

    async fn close(&self, _reason: &str) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn remote_address(&self) -> &str {
        "loopback-relay:22"
    }
}

#[derive(Debug)]
pub struct LoopbackListener {
    addr: BindAddress,
    socket: Option<TcpListener>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl RemoteListener for LoopbackListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> TransportResult<(Self::Stream, PeerInfo)> {
        let socket = self.socket.as_ref().ok_or(TransportError::SessionClosed)?;
        let closed = &mut self.closed;
        let session_closed = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };
        tokio::select! {
            _ = session_closed => Err(TransportError::SessionClosed),
            accepted = socket.accept() => {
                let (stream, peer) = accepted?;
                Ok((
                    stream,
                    PeerInfo {
                        originator_address: peer.ip().to_string(),
                        originator_port: peer.port() as u32,
                    },
                ))
            }
        }
    }

    fn bind_address(&self) -> &BindAddress {
        &self.addr
    }

    async fn close(&mut self) {
        self.socket = None;
    }
}

/// A port that nothing is listening on right now
pub async fn free_port() -> u16 {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

/// Wait until the agent reports its bound remote address
pub async fn wait_listening(
    state: &mut watch::Receiver<rtunnel_agent::AgentState>,
) -> BindAddress {
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| matches!(s, rtunnel_agent::AgentState::Listening(_))),
    )
    .await
    .expect("agent never started listening")
    .unwrap()
    .clone();

    match state {
        rtunnel_agent::AgentState::Listening(addr) => addr,
        other => panic!("unexpected state {:?}", other),
    }
}

/// Echo server standing in for the local service
pub async fn spawn_echo_service() -> String {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = socket.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}
