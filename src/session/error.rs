use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("設定エラー: {0}")]
    Configuration(String),
    #[error("セッションを開始できません: {0}")]
    NotStarted(String),
    #[error("集計の不変条件違反: 未登録のターゲット `{target}` の結果を受け取りました")]
    UnknownTarget { target: String },
    #[error("集計の不変条件違反: セッション `{session_id}` は確定済みです")]
    Finalized { session_id: String },
}

impl SessionError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SessionError::Configuration(message.into())
    }
}
