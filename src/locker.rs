use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::config::LockConfig;
use crate::error::LockError;

const GRAPHICAL_SEAT: &str = "seat0";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// The session was locked using the named method.
    Locked(&'static str),
    /// The session was already locked, nothing was invoked.
    AlreadyLocked,
    DryRun,
}

/// Locks the current user session.
///
/// Callers decide how often this runs; implementations never retry.
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self) -> Result<LockOutcome, LockError>;

    /// Whether the session is locked already.
    async fn is_locked(&self) -> Result<bool, LockError>;
}

/// External programs used to inspect and lock the session.
#[derive(Clone, Debug)]
struct Programs {
    dbus_send: String,
    loginctl: String,
    whoami: String,
}

impl Default for Programs {
    fn default() -> Self {
        Programs {
            dbus_send: "dbus-send".to_string(),
            loginctl: "loginctl".to_string(),
            whoami: "whoami".to_string(),
        }
    }
}

/// Locks a desktop session through GNOME's screensaver or logind.
pub struct SessionLocker {
    command_timeout: Duration,
    skip_if_locked: bool,
    programs: Programs,
    /// Overrides `$USER`/`whoami`.
    user: Option<String>,
}

impl SessionLocker {
    pub fn new(config: &LockConfig) -> Self {
        SessionLocker {
            command_timeout: config.command_timeout(),
            skip_if_locked: config.skip_if_locked,
            programs: Programs::default(),
            user: None,
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, LockError> {
        run_command(program, args, self.command_timeout).await
    }

    async fn current_user(&self) -> Result<String, LockError> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }
        match std::env::var("USER") {
            Ok(user) if !user.is_empty() => Ok(user),
            _ => Ok(self.run(&self.programs.whoami, &[]).await?.trim().to_string()),
        }
    }

    /// The logind session of the current user on the graphical seat, if any.
    async fn session_id(&self) -> Result<Option<String>, LockError> {
        let user = self.current_user().await?;
        let sessions = self
            .run(&self.programs.loginctl, &["list-sessions", "--no-legend"])
            .await?;
        Ok(find_graphical_session(&sessions, &user))
    }

    async fn check_via_loginctl(&self) -> Result<bool, LockError> {
        let Some(session) = self.session_id().await? else {
            debug!("No graphical session found, treating as locked");
            return Ok(true);
        };
        let properties = self
            .run(&self.programs.loginctl, &["show-session", &session])
            .await?;
        let status = SessionStatus::parse(&properties);
        Ok(!status.active || status.locked_hint)
    }

    async fn check_via_dbus(&self) -> Result<bool, LockError> {
        let reply = self
            .run(
                &self.programs.dbus_send,
                &[
                    "--session",
                    "--dest=org.gnome.ScreenSaver",
                    "--print-reply",
                    "/org/gnome/ScreenSaver",
                    "org.gnome.ScreenSaver.GetActive",
                ],
            )
            .await?;
        Ok(reply.to_lowercase().contains("boolean true"))
    }

    async fn lock_via_dbus(&self) -> Result<(), LockError> {
        self.run(
            &self.programs.dbus_send,
            &[
                "--session",
                "--dest=org.gnome.ScreenSaver",
                "--type=method_call",
                "/org/gnome/ScreenSaver",
                "org.gnome.ScreenSaver.Lock",
            ],
        )
        .await
        .map(|_| ())
    }

    async fn lock_via_loginctl(&self) -> Result<(), LockError> {
        let session = match self.session_id().await? {
            Some(session) => session,
            None => return Err(LockError::NoSession(self.current_user().await?)),
        };
        self.run(&self.programs.loginctl, &["lock-session", &session])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Locker for SessionLocker {
    async fn lock(&self) -> Result<LockOutcome, LockError> {
        if self.skip_if_locked {
            match self.is_locked().await {
                Ok(true) => return Ok(LockOutcome::AlreadyLocked),
                Ok(false) => {}
                Err(err) => warn!("Could not determine lock status, locking anyway: {}", err),
            }
        }

        match self.lock_via_dbus().await {
            Ok(()) => return Ok(LockOutcome::Locked("dbus-send")),
            Err(err) => warn!("GNOME screensaver lock failed: {}", err),
        }

        match self.lock_via_loginctl().await {
            Ok(()) => return Ok(LockOutcome::Locked("loginctl")),
            Err(err) => warn!("loginctl lock failed: {}", err),
        }

        Err(LockError::AllMethodsFailed)
    }

    // A user with no graphical session, or an inactive one, has nothing
    // left to lock.
    async fn is_locked(&self) -> Result<bool, LockError> {
        match self.check_via_loginctl().await {
            Ok(locked) => return Ok(locked),
            Err(err) => debug!("loginctl lock status check failed: {}", err),
        }
        self.check_via_dbus().await
    }
}

/// Logs the lock it would have performed.
pub struct DryRunLocker;

#[async_trait]
impl Locker for DryRunLocker {
    async fn lock(&self) -> Result<LockOutcome, LockError> {
        info!("Dry run: not locking the session");
        Ok(LockOutcome::DryRun)
    }

    async fn is_locked(&self) -> Result<bool, LockError> {
        Ok(false)
    }
}

async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<String, LockError> {
    debug!("Running {} {:?}", program, args);
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(LockError::CommandFailed {
                program: program.to_string(),
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(LockError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LockError::CommandFailed {
            program: program.to_string(),
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Picks the session id from `loginctl list-sessions --no-legend` output.
///
/// Columns are `SESSION UID USER SEAT ...`; newer systemd versions append more.
fn find_graphical_session(sessions: &str, user: &str) -> Option<String> {
    sessions.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [session, _uid, owner, seat, ..] if *owner == user && *seat == GRAPHICAL_SEAT => {
                Some(session.to_string())
            }
            _ => None,
        }
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct SessionStatus {
    active: bool,
    locked_hint: bool,
}

impl SessionStatus {
    /// Reads `key=value` lines from `loginctl show-session`.
    fn parse(properties: &str) -> Self {
        let mut status = SessionStatus::default();
        for line in properties.lines() {
            match line.trim().split_once('=') {
                Some(("Active", value)) => status.active = value == "yes",
                Some(("LockedHint", value)) => status.locked_hint = value == "yes",
                _ => {}
            }
        }
        status
    }
}
