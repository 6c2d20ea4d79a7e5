//! Runtime for `scraps watch`: feeds supervisor events and typed commands into
//! the session reducer and prints what comes out.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use scraps_core::backoff::Backoff;
use scraps_core::claims::{ClaimVerdict, DEFAULT_DESCRIPTION, DEFAULT_TTL_SECONDS};
use scraps_core::config::TransportKind;
use scraps_core::event::EventKind;
use scraps_core::reference::BranchRef;
use scraps_core::watch::{reduce, Msg, WatchFilter, WatchModel};
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::claim::ClaimClient;
use crate::output::SignalPrinter;
use crate::supervisor::{Supervisor, SupervisorEvent};
use crate::transport::{ConnectError, SseTransport, Subscription, Transport, WsTransport};

const SUPERVISOR_CAPACITY: usize = 256;
const NOTICE_CAPACITY: usize = 16;

pub fn build_transport(kind: TransportKind, api: &ApiClient) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Sse => Arc::new(SseTransport::new(
            api.http().clone(),
            api.host(),
            api.api_key(),
        )),
        TransportKind::Ws => Arc::new(WsTransport::new(api.host(), api.api_key())),
    }
}

/// A line typed while watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    /// `/text` sets the text filter, a bare `/` clears it.
    Filter(String),
    /// `t commit,claim` limits event kinds, a bare `t` shows all.
    Kinds(BTreeSet<EventKind>),
    ToggleClaims,
    Claim(Vec<String>),
    Release(Vec<String>),
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Option<WatchCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(text) = line.strip_prefix('/') {
        return Some(WatchCommand::Filter(text.to_owned()));
    }

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    let rest: Vec<String> = words.map(str::to_owned).collect();
    let cmd = match head {
        "q" | "quit" => WatchCommand::Quit,
        "c" if rest.is_empty() => WatchCommand::ToggleClaims,
        "t" => {
            let mut kinds = BTreeSet::new();
            for name in rest.iter().flat_map(|w| w.split(',')).filter(|w| !w.is_empty()) {
                match name.parse::<EventKind>() {
                    Ok(kind) => {
                        kinds.insert(kind);
                    }
                    Err(_) => return Some(WatchCommand::Unknown(line.to_owned())),
                }
            }
            WatchCommand::Kinds(kinds)
        }
        "claim" if !rest.is_empty() => WatchCommand::Claim(rest),
        "release" if !rest.is_empty() => WatchCommand::Release(rest),
        _ => WatchCommand::Unknown(line.to_owned()),
    };
    Some(cmd)
}

/// Claims made from inside a watch session share one agent identity so a
/// later `release` matches them.
#[derive(Debug, Clone)]
pub struct SessionClaims {
    client: ClaimClient,
    branch: BranchRef,
    agent_id: String,
}

impl SessionClaims {
    pub fn new(client: ClaimClient, branch: BranchRef, agent_id: String) -> Self {
        Self {
            client,
            branch,
            agent_id,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn claim(&self, patterns: Vec<String>) -> String {
        let shown = patterns.join(", ");
        let res = self
            .client
            .claim(
                &self.branch,
                patterns,
                DEFAULT_DESCRIPTION,
                DEFAULT_TTL_SECONDS,
                Some(self.agent_id.clone()),
            )
            .await;
        match res {
            Ok(outcome) => match outcome.verdict {
                ClaimVerdict::Granted { expires_at } => {
                    format!("claimed {shown} as {} (expires {expires_at})", self.agent_id)
                }
                ClaimVerdict::Conflict { competitors } => {
                    let held: Vec<String> = competitors
                        .iter()
                        .map(|c| format!("{} holds {}", c.display_name(), c.patterns.join(", ")))
                        .collect();
                    format!("claim conflict on {shown}: {}", held.join("; "))
                }
            },
            Err(err) => format!("claim failed: {err}"),
        }
    }

    async fn release(&self, patterns: Vec<String>) -> String {
        let shown = patterns.join(", ");
        match self.client.release(&self.branch, patterns, &self.agent_id).await {
            Ok(outcome) => match (outcome.released(), outcome.message()) {
                (_, Some(message)) => format!("release {shown}: {message}"),
                (Some(n), None) => format!("released {shown} ({n} claim(s))"),
                (None, None) => format!("released {shown}"),
            },
            Err(err) => format!("release failed: {err}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub subscription: Subscription,
    pub filter: WatchFilter,
    pub show_claims: bool,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReport<W> {
    pub events_seen: u64,
    pub warnings: u64,
    pub out: W,
}

pub struct WatchSession<W: Write> {
    transport: Arc<dyn Transport>,
    options: WatchOptions,
    printer: SignalPrinter<W>,
    claims: Option<SessionClaims>,
    cancel: CancellationToken,
}

impl<W: Write> WatchSession<W> {
    pub fn new(
        transport: Arc<dyn Transport>,
        options: WatchOptions,
        printer: SignalPrinter<W>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            options,
            printer,
            claims: None,
            cancel,
        }
    }

    pub fn with_claims(mut self, claims: SessionClaims) -> Self {
        self.claims = Some(claims);
        self
    }

    /// Runs until cancelled, `q` is typed, or the server rejects the
    /// credential. A rejected credential is returned as an error after the
    /// session has printed its closing status.
    pub async fn run(
        mut self,
        mut commands: Option<mpsc::Receiver<String>>,
    ) -> anyhow::Result<WatchReport<W>> {
        let supervisor = Supervisor::new(
            Arc::clone(&self.transport),
            self.options.subscription.clone(),
            self.options.backoff,
            self.cancel.clone(),
        );
        let (mut events, join) = supervisor.spawn(SUPERVISOR_CAPACITY);
        let (notice_tx, mut notices) = mpsc::channel::<String>(NOTICE_CAPACITY);

        let mut model = WatchModel::new(self.options.filter.clone(), self.options.show_claims);
        let mut fatal: Option<ConnectError> = None;

        loop {
            let msg = tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => {
                        let stopped = matches!(ev, SupervisorEvent::Stopped);
                        let msg = match ev {
                            SupervisorEvent::Fatal(err) => {
                                let msg = Msg::Fatal(err.to_string());
                                fatal = Some(err);
                                msg
                            }
                            other => supervisor_msg(other),
                        };
                        model = self.apply(model, msg)?;
                        if stopped || model.is_closed() {
                            break;
                        }
                        continue;
                    }
                    None => break,
                },
                line = next_line(&mut commands) => match line {
                    Some(line) => match parse_command(&line) {
                        Some(cmd) => match self.command(cmd, &notice_tx) {
                            Some(msg) => msg,
                            None => continue,
                        },
                        None => continue,
                    },
                    None => {
                        commands = None;
                        continue;
                    }
                },
                Some(notice) = notices.recv() => Msg::Notice(notice),
            };
            model = self.apply(model, msg)?;
        }

        self.cancel.cancel();
        if !model.is_closed() {
            model = self.apply(model, Msg::Cancelled)?;
        }
        let _ = join.await;

        if let Some(err) = fatal {
            return Err(anyhow::Error::new(err).context("live feed rejected the subscription"));
        }
        Ok(WatchReport {
            events_seen: model.events_seen,
            warnings: model.warnings,
            out: self.printer.into_inner(),
        })
    }

    fn apply(&mut self, model: WatchModel, msg: Msg) -> anyhow::Result<WatchModel> {
        let (model, signals) = reduce(model, msg);
        self.printer
            .print_all(&signals)
            .context("write watch output")?;
        Ok(model)
    }

    fn command(&self, cmd: WatchCommand, notices: &mpsc::Sender<String>) -> Option<Msg> {
        match cmd {
            WatchCommand::Filter(text) => Some(Msg::SetFilter(text)),
            WatchCommand::Kinds(kinds) => Some(Msg::SetKinds(kinds)),
            WatchCommand::ToggleClaims => Some(Msg::ToggleClaims),
            WatchCommand::Quit => {
                self.cancel.cancel();
                None
            }
            WatchCommand::Unknown(line) => Some(Msg::Notice(format!(
                "unknown command: {line} (try /text, t kinds, c, claim <pattern>, release <pattern>, q)"
            ))),
            WatchCommand::Claim(_) | WatchCommand::Release(_) if self.claims.is_none() => Some(
                Msg::Notice("claims need a branch (watch store/repo:branch)".to_owned()),
            ),
            WatchCommand::Claim(patterns) => {
                let claims = self.claims.clone()?;
                let tx = notices.clone();
                tokio::spawn(async move {
                    let _ = tx.send(claims.claim(patterns).await).await;
                });
                None
            }
            WatchCommand::Release(patterns) => {
                let claims = self.claims.clone()?;
                let tx = notices.clone();
                tokio::spawn(async move {
                    let _ = tx.send(claims.release(patterns).await).await;
                });
                None
            }
        }
    }
}

fn supervisor_msg(ev: SupervisorEvent) -> Msg {
    match ev {
        SupervisorEvent::Connecting { .. } => Msg::Connecting,
        SupervisorEvent::Connected => Msg::Connected,
        SupervisorEvent::Event(event) => Msg::Event(event),
        SupervisorEvent::DecodeWarning(message) => Msg::DecodeWarning(message),
        SupervisorEvent::Disconnected {
            attempt,
            retry_in,
            reason,
        } => Msg::Disconnected {
            attempt,
            retry_in,
            now: Instant::now(),
            reason,
        },
        SupervisorEvent::Fatal(err) => Msg::Fatal(err.to_string()),
        SupervisorEvent::Stopped => Msg::Cancelled,
    }
}

async fn next_line(commands: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Forwards stdin lines until EOF.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(NOTICE_CAPACITY);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use scraps_core::config::OutputFormat;
    use scraps_core::frame::Framing;
    use scraps_core::reference::RepoRef;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::transport::Connection;

    #[test]
    fn parses_typed_commands() {
        assert_eq!(parse_command("  "), None);
        assert_eq!(parse_command("/Auth"), Some(WatchCommand::Filter("Auth".to_owned())));
        assert_eq!(parse_command("/"), Some(WatchCommand::Filter(String::new())));
        assert_eq!(parse_command("c"), Some(WatchCommand::ToggleClaims));
        assert_eq!(parse_command("q"), Some(WatchCommand::Quit));
        assert_eq!(
            parse_command("claim src/** docs/*.md"),
            Some(WatchCommand::Claim(vec!["src/**".to_owned(), "docs/*.md".to_owned()]))
        );
        assert_eq!(
            parse_command("release src/**"),
            Some(WatchCommand::Release(vec!["src/**".to_owned()]))
        );
        assert_eq!(
            parse_command("t commit,claim"),
            Some(WatchCommand::Kinds(
                [EventKind::Commit, EventKind::Claim].into_iter().collect()
            ))
        );
        assert_eq!(parse_command("t"), Some(WatchCommand::Kinds(BTreeSet::new())));
        assert!(matches!(parse_command("t bogus"), Some(WatchCommand::Unknown(_))));
        assert!(matches!(parse_command("claim"), Some(WatchCommand::Unknown(_))));
    }

    /// Serves scripted byte batches once, then hangs until closed.
    struct Scripted {
        batches: Mutex<Option<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Transport for Scripted {
        fn framing(&self) -> Framing {
            Framing::Message
        }

        async fn connect(&self, _sub: &Subscription) -> Result<Connection, ConnectError> {
            let batches = self.batches.lock().unwrap().take();
            match batches {
                Some(batches) => {
                    let items: Vec<Result<Bytes, String>> =
                        batches.into_iter().map(|b| Ok(Bytes::from_static(b.as_bytes()))).collect();
                    Ok(Connection::spawn(
                        futures::StreamExt::chain(futures::stream::iter(items), futures::stream::pending()),
                    ))
                }
                None => Err(ConnectError::Network("gone".to_owned())),
            }
        }
    }

    fn options() -> WatchOptions {
        WatchOptions {
            subscription: Subscription::new(RepoRef::parse("acme/web:main").unwrap(), None, None),
            filter: WatchFilter::default(),
            show_claims: true,
            backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(5)),
        }
    }

    #[tokio::test]
    async fn session_prints_events_and_quits_on_q() {
        let transport = Arc::new(Scripted {
            batches: Mutex::new(Some(vec![
                r#"{"type":"commit","sha":"abcdef1234","message":"fix bug","files":[{"action":"add","path":"a.rs"}]}"#,
                r#"{"type":"agent_claim","agent_id":"a1","patterns":["src/**"]}"#,
                "not json",
            ])),
        });
        let printer = SignalPrinter::new(Vec::new(), OutputFormat::Table).without_timestamps();
        let session = WatchSession::new(transport, options(), printer, CancellationToken::new());

        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(session.run(Some(rx)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send("q".to_owned()).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.events_seen, 2);
        assert_eq!(report.warnings, 1);

        let out = String::from_utf8(report.out).unwrap();
        assert!(out.contains("-- connected"), "{out}");
        assert!(out.contains("COMMIT         abcdef1 fix bug\n    + a.rs"), "{out}");
        assert!(out.contains("    src/**"), "{out}");
        assert!(out.contains("!! "), "{out}");
        assert!(out.trim_end().ends_with("-- cancelled"), "{out}");
    }

    struct Rejecting;

    #[async_trait]
    impl Transport for Rejecting {
        fn framing(&self) -> Framing {
            Framing::EventStream
        }

        async fn connect(&self, _sub: &Subscription) -> Result<Connection, ConnectError> {
            Err(ConnectError::from_status(401, "bad key".to_owned()))
        }
    }

    #[tokio::test]
    async fn rejected_credential_ends_the_session_with_an_error() {
        let printer = SignalPrinter::new(Vec::new(), OutputFormat::Json);
        let session = WatchSession::new(Arc::new(Rejecting), options(), printer, CancellationToken::new());
        let err = tokio::time::timeout(Duration::from_secs(5), session.run(None))
            .await
            .unwrap()
            .unwrap_err();
        assert!(format!("{err:#}").contains("unauthorized (401): bad key"), "{err:#}");
    }

    #[tokio::test]
    async fn claim_command_without_branch_is_a_notice() {
        let transport = Arc::new(Scripted {
            batches: Mutex::new(Some(vec![])),
        });
        let printer = SignalPrinter::new(Vec::new(), OutputFormat::Table).without_timestamps();
        let cancel = CancellationToken::new();
        let session = WatchSession::new(transport, options(), printer, cancel.clone());

        let (tx, rx) = mpsc::channel(4);
        let run = tokio::spawn(session.run(Some(rx)));
        tx.send("claim src/**".to_owned()).await.unwrap();
        tx.send("/auth".to_owned()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let out = String::from_utf8(report.out).unwrap();
        assert!(out.contains("-- claims need a branch"), "{out}");
        assert!(out.contains("-- filter: auth"), "{out}");
    }
}
