//! Errors - エラーの運用分類
//!
//! 各 seam ごとのエラー型（`ClientError`, `ChannelError`, `BufferError` など）は
//! それぞれのモジュールに置き、ここでは共通の分類だけを定義します。

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（次の tick / poll でリトライ）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（キュー / ストアの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// Classify maps an error onto an [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
