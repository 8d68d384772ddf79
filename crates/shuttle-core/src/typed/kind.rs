//! JobKind trait - job_type と payload 型の対応付け

use serde::de::DeserializeOwned;
use serde::Serialize;

/// JobKind は job_type と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl JobKind for SendEmail {
///     const TYPE: &'static str = "mail.send.v1";
///     type Output = ();
/// }
/// ```
///
/// # 命名規約
/// - `{domain}.{action}.v{major}`
/// - payload の形を壊す変更は major を上げて別の job_type にする
pub trait JobKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;

    /// Stored as the job result (JSON).
    type Output: Serialize + Send;
}
