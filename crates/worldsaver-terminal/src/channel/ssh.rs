use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use worldsaver_core::{CoreError, Endpoint, Result};

use super::{ConsoleOutput, TerminalChannel};
use crate::known_hosts::{HostKeyStatus, HostKeyStore};

struct HostKeyCheck {
    host: String,
    store: Arc<Mutex<HostKeyStore>>,
    rejected: Arc<AtomicBool>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let Ok(mut store) = self.store.lock() else {
            self.rejected.store(true, Ordering::SeqCst);
            return Ok(false);
        };

        match store.validate(&self.host, &fingerprint) {
            HostKeyStatus::Ok => Ok(true),
            HostKeyStatus::NotFound => {
                info!(host = %self.host, %fingerprint, "trusting host key on first use");
                if let Err(err) = store.trust(&self.host, &fingerprint) {
                    warn!(host = %self.host, "failed to record host key: {err}");
                }
                Ok(true)
            }
            HostKeyStatus::Changed => {
                error!(host = %self.host, %fingerprint, "host key changed, refusing to connect");
                self.rejected.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }
}

/// Interactive shell on a remote console (for example a server wrapper's SSH console).
pub struct SshChannel {
    endpoint: Endpoint,
    username: String,
    password: String,
    known_hosts: Arc<Mutex<HostKeyStore>>,
    output: ConsoleOutput,
    connected: Arc<AtomicBool>,
    session: Option<Handle<HostKeyCheck>>,
    input: Option<mpsc::Sender<Vec<u8>>>,
    pump: Option<JoinHandle<()>>,
}

impl SshChannel {
    pub fn new(
        endpoint: Endpoint,
        username: String,
        password: String,
        known_hosts: Arc<Mutex<HostKeyStore>>,
    ) -> Self {
        Self {
            endpoint,
            username,
            password,
            known_hosts,
            output: ConsoleOutput::default(),
            connected: Arc::new(AtomicBool::new(false)),
            session: None,
            input: None,
            pump: None,
        }
    }

    fn transport(&self, action: &str, err: impl std::fmt::Display) -> CoreError {
        CoreError::Transport(format!("ssh {action} {} failed: {err}", self.endpoint))
    }
}

async fn pump_channel(
    mut channel: Channel<Msg>,
    mut input: mpsc::Receiver<Vec<u8>>,
    output: ConsoleOutput,
    connected: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    output.publish(String::from_utf8_lossy(&data).into_owned());
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            line = input.recv() => match line {
                Some(bytes) => {
                    if let Err(err) = channel.data(&bytes[..]).await {
                        warn!("ssh write failed: {err}");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = channel.eof().await;
}

#[async_trait]
impl TerminalChannel for SshChannel {
    fn describe(&self) -> String {
        format!("ssh:{}@{}", self.username, self.endpoint)
    }

    async fn start(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let rejected = Arc::new(AtomicBool::new(false));
        let handler = HostKeyCheck {
            host: self.endpoint.to_string(),
            store: self.known_hosts.clone(),
            rejected: rejected.clone(),
        };
        let config = Arc::new(client::Config::default());
        let mut session = match client::connect(
            config,
            (self.endpoint.host.as_str(), self.endpoint.port),
            handler,
        )
        .await
        {
            Ok(session) => session,
            Err(_) if rejected.load(Ordering::SeqCst) => {
                return Err(CoreError::HostKeyChanged {
                    host: self.endpoint.to_string(),
                });
            }
            Err(err) => return Err(self.transport("connect to", err)),
        };

        let accepted = session
            .authenticate_password(self.username.clone(), self.password.clone())
            .await
            .map_err(|err| self.transport("authentication with", err))?;
        if !accepted {
            return Err(CoreError::AuthenticationFailed(self.endpoint.to_string()));
        }

        let channel = session
            .channel_open_session()
            .await
            .map_err(|err| self.transport("session on", err))?;
        channel
            .request_pty(false, "xterm", 160, 48, 0, 0, &[])
            .await
            .map_err(|err| self.transport("pty request on", err))?;
        channel
            .request_shell(true)
            .await
            .map_err(|err| self.transport("shell request on", err))?;

        let (tx, rx) = mpsc::channel(32);
        self.connected.store(true, Ordering::SeqCst);
        self.pump = Some(tokio::spawn(pump_channel(
            channel,
            rx,
            self.output.clone(),
            self.connected.clone(),
        )));
        self.input = Some(tx);
        self.session = Some(session);
        info!(endpoint = %self.endpoint, "connected to remote console");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.output.subscribe()
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let Some(input) = self.input.as_ref() else {
            return Err(CoreError::NotConnected);
        };
        if input.send(format!("{line}\n").into_bytes()).await.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(CoreError::NotConnected);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.input = None;
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        if let Some(session) = self.session.take() {
            if let Err(err) = session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                warn!(endpoint = %self.endpoint, "ssh disconnect failed: {err}");
            }
        }
        Ok(())
    }
}
