use std::fmt;

use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    InvalidArgs,
    SessionFailed,
    ReportFailed,
    Interrupted,
}

impl ExitCode {
    pub const fn as_i32(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::InvalidArgs => 2,
            ExitCode::SessionFailed => 10,
            ExitCode::ReportFailed => 20,
            ExitCode::Interrupted => 130,
        }
    }
}

#[derive(Debug)]
pub struct ExitError {
    pub code: ExitCode,
    pub err: anyhow::Error,
}

impl ExitError {
    pub fn new(code: ExitCode, err: anyhow::Error) -> Self {
        Self { code, err }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl std::error::Error for ExitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.err.as_ref())
    }
}

pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(exit) = err.downcast_ref::<ExitError>() {
        return exit.code.as_i32();
    }
    if let Some(session) = err.downcast_ref::<SessionError>() {
        return match session {
            SessionError::Configuration(_) => ExitCode::InvalidArgs,
            _ => ExitCode::SessionFailed,
        }
        .as_i32();
    }
    ExitCode::SessionFailed.as_i32()
}

pub fn invalid_args(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, anyhow::anyhow!(message.into())).into()
}

pub fn invalid_args_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::InvalidArgs, err).into()
}

pub fn report_failed_err(err: anyhow::Error) -> anyhow::Error {
    ExitError::new(ExitCode::ReportFailed, err).into()
}

pub fn interrupted(message: impl Into<String>) -> anyhow::Error {
    ExitError::new(ExitCode::Interrupted, anyhow::anyhow!(message.into())).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_codes() {
        let config: anyhow::Error = SessionError::configuration("x").into();
        assert_eq!(exit_code(&config), 2);
        let not_started: anyhow::Error = SessionError::NotStarted("x".into()).into();
        assert_eq!(exit_code(&not_started), 10);
        let unknown: anyhow::Error = SessionError::UnknownTarget {
            target: "t".into(),
        }
        .into();
        assert_eq!(exit_code(&unknown), 10);
    }

    #[test]
    fn context_keeps_downcast_working() {
        use anyhow::Context;
        let err = Err::<(), _>(SessionError::configuration("x"))
            .context("outer")
            .unwrap_err();
        assert_eq!(exit_code(&err), 2);
        assert_eq!(exit_code(&interrupted("stop")), 130);
        assert_eq!(exit_code(&report_failed_err(anyhow::anyhow!("io"))), 20);
    }
}
