//! Platform signal sources feeding [`ShutdownManager::handle_signal`].
//!
//! The phase machine never touches the OS directly. A [`SignalSource`] owns
//! handler registration for one platform and forwards every delivery as a
//! [`SignalKind`].

use std::{fmt, sync::Arc};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{error::Result, manager::ShutdownManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// SIGINT or Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    CtrlBreak,
    ConsoleClose,
    Logoff,
    SystemShutdown,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::CtrlBreak => "ctrl-break",
            Self::ConsoleClose => "console-close",
            Self::Logoff => "logoff",
            Self::SystemShutdown => "system-shutdown",
        };
        f.write_str(name)
    }
}

pub trait SignalSource: Send {
    fn name(&self) -> &'static str;

    /// Register OS handlers and spawn a task forwarding every delivery to
    /// `manager`. Must be called inside a tokio runtime.
    fn install(self: Box<Self>, manager: Arc<ShutdownManager>) -> Result<JoinHandle<()>>;
}

/// SIGINT and SIGTERM.
#[cfg(unix)]
pub struct PosixSignals;

#[cfg(unix)]
impl SignalSource for PosixSignals {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn install(self: Box<Self>, manager: Arc<ShutdownManager>) -> Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind as UnixSignal};

        let install = |kind: UnixSignal| {
            signal(kind).map_err(|e| crate::ShutdownError::SignalInstall(e.to_string()))
        };
        let mut interrupt = install(UnixSignal::interrupt())?;
        let mut terminate = install(UnixSignal::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let kind = tokio::select! {
                    Some(()) = interrupt.recv() => SignalKind::Interrupt,
                    Some(()) = terminate.recv() => SignalKind::Terminate,
                    else => break,
                };
                manager.handle_signal(kind);
            }
            debug!("posix signal streams closed");
        }))
    }
}

/// Console control events: Ctrl-C, Ctrl-Break, close, logoff and system
/// shutdown.
#[cfg(windows)]
pub struct ConsoleControl;

#[cfg(windows)]
impl SignalSource for ConsoleControl {
    fn name(&self) -> &'static str {
        "console-control"
    }

    fn install(self: Box<Self>, manager: Arc<ShutdownManager>) -> Result<JoinHandle<()>> {
        use tokio::signal::windows;

        let err = |e: std::io::Error| crate::ShutdownError::SignalInstall(e.to_string());
        let mut ctrl_c = windows::ctrl_c().map_err(err)?;
        let mut ctrl_break = windows::ctrl_break().map_err(err)?;
        let mut close = windows::ctrl_close().map_err(err)?;
        let mut logoff = windows::ctrl_logoff().map_err(err)?;
        let mut shutdown = windows::ctrl_shutdown().map_err(err)?;

        Ok(tokio::spawn(async move {
            loop {
                let kind = tokio::select! {
                    Some(()) = ctrl_c.recv() => SignalKind::Interrupt,
                    Some(()) = ctrl_break.recv() => SignalKind::CtrlBreak,
                    Some(()) = close.recv() => SignalKind::ConsoleClose,
                    Some(()) = logoff.recv() => SignalKind::Logoff,
                    Some(()) = shutdown.recv() => SignalKind::SystemShutdown,
                    else => break,
                };
                manager.handle_signal(kind);
            }
            debug!("console control streams closed");
        }))
    }
}

/// The signal source for the platform this binary was built for.
pub fn platform_default() -> Box<dyn SignalSource> {
    #[cfg(unix)]
    {
        Box::new(PosixSignals)
    }
    #[cfg(windows)]
    {
        Box::new(ConsoleControl)
    }
}
