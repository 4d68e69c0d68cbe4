//! Autosave pause/resume exchanges for Bedrock and Java consoles.
//!
//! Bedrock: `save hold`, then `save query` until the files are ready; `save resume`.
//! Java: `save-all flush`, `save-off`; `save-on`.

use tokio::time::Duration;
use tracing::{debug, info, warn};

use worldsaver_core::{CoreError, Result, ServerKind};

use crate::channel::TerminalChannel;
use crate::expect::{ExpectMatcher, MatchResult, Pattern};

pub const SAVE_QUERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveTimeouts {
    pub save_hold: Duration,
    pub save_query: Duration,
    pub flush: Duration,
    pub save_off: Duration,
    pub resume: Duration,
}

impl Default for AutosaveTimeouts {
    fn default() -> Self {
        Self {
            save_hold: Duration::from_secs(10),
            save_query: Duration::from_secs(10),
            flush: Duration::from_secs(30),
            save_off: Duration::from_secs(10),
            resume: Duration::from_secs(60),
        }
    }
}

/// A console together with the autosave protocol of its server flavor.
pub struct ContainerTerminal {
    kind: ServerKind,
    channel: Box<dyn TerminalChannel>,
    matcher: ExpectMatcher,
    timeouts: AutosaveTimeouts,
}

impl ContainerTerminal {
    pub fn new(kind: ServerKind, channel: Box<dyn TerminalChannel>) -> Self {
        Self {
            kind,
            channel,
            matcher: ExpectMatcher::default(),
            timeouts: AutosaveTimeouts::default(),
        }
    }

    pub fn channel(&self) -> &dyn TerminalChannel {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> &mut dyn TerminalChannel {
        self.channel.as_mut()
    }

    pub async fn pause_autosave(&mut self) -> Result<()> {
        match self.kind {
            ServerKind::Bedrock => self.pause_bedrock().await,
            ServerKind::Java => self.pause_java().await,
        }
    }

    pub async fn resume_autosave(&mut self) -> Result<()> {
        match self.kind {
            ServerKind::Bedrock => self.resume_bedrock().await,
            ServerKind::Java => self.resume_java().await,
        }
    }

    async fn send_and_expect(
        &mut self,
        command: &str,
        candidates: &[Pattern],
        timeout: Duration,
    ) -> Result<MatchResult> {
        if !self.channel.is_connected() {
            return Err(CoreError::NotConnected);
        }
        // subscribe first so the reply cannot slip past
        let mut output = self.channel.subscribe();
        debug!(channel = %self.channel.describe(), command, "sending console command");
        self.channel.send_line(command).await?;
        self.matcher.expect(&mut output, candidates, timeout).await
    }

    async fn pause_bedrock(&mut self) -> Result<()> {
        let hold = [
            Pattern::text("Saving"),
            Pattern::text("The command is already running"),
        ];
        if self
            .send_and_expect("save hold", &hold, self.timeouts.save_hold)
            .await?
            == MatchResult::NoMatch
        {
            return Err(CoreError::PauseFailed("no reply to save hold".into()));
        }

        let ready = [Pattern::text("Files are now ready to be copied")];
        for attempt in 1..=SAVE_QUERY_ATTEMPTS {
            match self
                .send_and_expect("save query", &ready, self.timeouts.save_query)
                .await?
            {
                MatchResult::Matched(_) => {
                    info!(attempt, "world files ready to copy");
                    return Ok(());
                }
                MatchResult::NoMatch => {
                    debug!(attempt, "world files not ready yet");
                }
            }
        }

        warn!("save query never reported the files as ready");
        Err(CoreError::SaveNotCompleted {
            attempts: SAVE_QUERY_ATTEMPTS,
        })
    }

    async fn resume_bedrock(&mut self) -> Result<()> {
        let resumed = [
            Pattern::text("Changes to the world are resumed"),
            Pattern::text("Changes to the level are resumed"),
            Pattern::text("A previous save has not been completed"),
        ];
        match self
            .send_and_expect("save resume", &resumed, self.timeouts.resume)
            .await?
        {
            MatchResult::Matched(_) => {
                info!("autosave resumed");
                Ok(())
            }
            MatchResult::NoMatch => Err(CoreError::ResumeFailed("no reply to save resume".into())),
        }
    }

    async fn pause_java(&mut self) -> Result<()> {
        let saved = [Pattern::text("Saved the game")];
        if self
            .send_and_expect("save-all flush", &saved, self.timeouts.flush)
            .await?
            == MatchResult::NoMatch
        {
            return Err(CoreError::PauseFailed("no reply to save-all flush".into()));
        }

        let disabled = [Pattern::text("Automatic saving is now disabled")];
        if self
            .send_and_expect("save-off", &disabled, self.timeouts.save_off)
            .await?
            == MatchResult::NoMatch
        {
            return Err(CoreError::PauseFailed("no reply to save-off".into()));
        }

        info!("world flushed and autosave disabled");
        Ok(())
    }

    async fn resume_java(&mut self) -> Result<()> {
        let enabled = [
            Pattern::text("Automatic saving is now enabled"),
            Pattern::text("Saving is already turned on"),
        ];
        match self
            .send_and_expect("save-on", &enabled, self.timeouts.resume)
            .await?
        {
            MatchResult::Matched(_) => {
                info!("autosave resumed");
                Ok(())
            }
            MatchResult::NoMatch => Err(CoreError::ResumeFailed("no reply to save-on".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConsoleOutput;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use tokio::sync::broadcast;

    /// Replies to known commands with canned output, in order.
    struct ScriptedChannel {
        output: ConsoleOutput,
        connected: bool,
        replies: HashMap<String, VecDeque<String>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedChannel {
        fn new(script: &[(&str, &str)]) -> (Self, Arc<Mutex<Vec<String>>>) {
            let mut replies: HashMap<String, VecDeque<String>> = HashMap::new();
            for (command, reply) in script {
                replies
                    .entry(command.to_string())
                    .or_default()
                    .push_back(reply.to_string());
            }
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    output: ConsoleOutput::default(),
                    connected: true,
                    replies,
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    #[async_trait]
    impl TerminalChannel for ScriptedChannel {
        fn describe(&self) -> String {
            "scripted".into()
        }

        async fn start(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn subscribe(&self) -> broadcast::Receiver<String> {
            self.output.subscribe()
        }

        async fn send_line(&mut self, line: &str) -> Result<()> {
            self.sent.lock().unwrap().push(line.to_string());
            if let Some(reply) = self.replies.get_mut(line).and_then(VecDeque::pop_front) {
                self.output.publish(reply);
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
    }

    fn scripted(kind: ServerKind, script: &[(&str, &str)]) -> (ContainerTerminal, Arc<Mutex<Vec<String>>>) {
        let (channel, sent) = ScriptedChannel::new(script);
        (ContainerTerminal::new(kind, Box::new(channel)), sent)
    }

    #[tokio::test(start_paused = true)]
    async fn bedrock_pause_polls_until_files_are_ready() {
        let (mut terminal, sent) = scripted(
            ServerKind::Bedrock,
            &[
                ("save hold", "Saving...\n"),
                ("save query", "A previous save has not been completed.\n"),
                ("save query", "Data saved. Files are now ready to be copied.\n"),
            ],
        );

        terminal.pause_autosave().await.expect("pause succeeds");
        assert_eq!(
            *sent.lock().unwrap(),
            vec!["save hold", "save query", "save query"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bedrock_pause_accepts_an_already_running_hold() {
        let (mut terminal, _) = scripted(
            ServerKind::Bedrock,
            &[
                ("save hold", "The command is already running\n"),
                ("save query", "Files are now ready to be copied.\n"),
            ],
        );
        terminal.pause_autosave().await.expect("pause succeeds");
    }

    #[tokio::test(start_paused = true)]
    async fn bedrock_pause_gives_up_after_three_queries() {
        let (mut terminal, sent) = scripted(ServerKind::Bedrock, &[("save hold", "Saving...\n")]);

        let err = terminal.pause_autosave().await.unwrap_err();
        assert!(matches!(err, CoreError::SaveNotCompleted { attempts: 3 }));
        assert_eq!(sent.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_console_fails_pause_and_resume() {
        let (mut terminal, _) = scripted(ServerKind::Bedrock, &[]);
        assert!(matches!(
            terminal.pause_autosave().await,
            Err(CoreError::PauseFailed(_))
        ));
        assert!(matches!(
            terminal.resume_autosave().await,
            Err(CoreError::ResumeFailed(_))
        ));

        let (mut java, _) = scripted(ServerKind::Java, &[]);
        assert!(matches!(java.pause_autosave().await, Err(CoreError::PauseFailed(_))));
        assert!(matches!(java.resume_autosave().await, Err(CoreError::ResumeFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bedrock_resume_accepts_legacy_phrasing() {
        let (mut terminal, sent) = scripted(
            ServerKind::Bedrock,
            &[("save resume", "Changes to the level are resumed.\n")],
        );
        terminal.resume_autosave().await.expect("resume succeeds");
        assert_eq!(*sent.lock().unwrap(), vec!["save resume"]);
    }

    #[tokio::test(start_paused = true)]
    async fn java_pause_flushes_then_disables_saving() {
        let (mut terminal, sent) = scripted(
            ServerKind::Java,
            &[
                ("save-all flush", "[Server thread/INFO]: Saved the game\n"),
                ("save-off", "[Server thread/INFO]: Automatic saving is now disabled\n"),
                ("save-on", "[Server thread/INFO]: Saving is already turned on\n"),
            ],
        );

        terminal.pause_autosave().await.expect("pause succeeds");
        terminal.resume_autosave().await.expect("resume succeeds");
        assert_eq!(
            *sent.lock().unwrap(),
            vec!["save-all flush", "save-off", "save-on"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn java_pause_fails_when_save_off_is_ignored() {
        let (mut terminal, _) = scripted(
            ServerKind::Java,
            &[("save-all flush", "Saved the game\n")],
        );
        assert!(matches!(
            terminal.pause_autosave().await,
            Err(CoreError::PauseFailed(message)) if message.contains("save-off")
        ));
    }

    #[tokio::test]
    async fn known_console_errors_surface_as_console_errors() {
        let (mut terminal, _) = scripted(
            ServerKind::Bedrock,
            &[(
                "save hold",
                "Got permission denied while trying to connect to the Docker daemon socket\n",
            )],
        );
        assert!(matches!(
            terminal.pause_autosave().await,
            Err(CoreError::Console(_))
        ));
    }

    #[tokio::test]
    async fn disconnected_console_is_rejected_up_front() {
        let (mut terminal, sent) = scripted(ServerKind::Java, &[]);
        terminal.channel_mut().close().await.unwrap();
        assert!(matches!(
            terminal.pause_autosave().await,
            Err(CoreError::NotConnected)
        ));
        assert!(sent.lock().unwrap().is_empty());
    }
}
