//! MethodHandler - remote から呼び出される service method
//!
//! # 学習ポイント
//! - Object-safe trait (MethodHandler) で `Arc<dyn MethodHandler>` として保持
//! - Type erasure パターン (TypedMethod<A, R, F> → MethodHandler)
//! - 位置引数の配列を tuple 型に serde でデシリアライズ

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;

/// Handler の失敗。メッセージはそのまま reply envelope の `message` になる
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// MethodHandler は位置引数を受け取り、1 つの値を返す
///
/// Dispatcher は decode 済みの引数配列をそのまま渡します。
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> Result<Value, HandlerError>;
}

/// クロージャをそのまま handler にする
///
/// ```ignore
/// let echo = FnMethod::new(|args: Vec<Value>| async move {
///     Ok(args.into_iter().next().unwrap_or(Value::Null))
/// });
/// ```
pub struct FnMethod<F> {
    f: F,
}

impl<F> FnMethod<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> MethodHandler for FnMethod<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        (self.f)(args).await
    }
}

/// 型付き handler
///
/// 引数配列を `A`（通常は tuple）に、戻り値 `R` を JSON 値に変換します。
///
/// # 使用例
/// ```ignore
/// let reverse = TypedMethod::new(|(text,): (String,)| async move {
///     Ok::<_, HandlerError>(text.chars().rev().collect::<String>())
/// });
/// ```
pub struct TypedMethod<A, R, F> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R, F, Fut> TypedMethod<A, R, F>
where
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<R, HandlerError>>,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A, R, F, Fut> MethodHandler for TypedMethod<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, HandlerError>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value, HandlerError> {
        let parsed: A = decode_args(args)?;
        let out = (self.f)(parsed).await?;
        serde_json::to_value(out).map_err(|e| HandlerError::new(format!("encode result: {e}")))
    }
}

/// 引数なしの呼び出しは `()` にも対応する
fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, HandlerError> {
    let empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(parsed) => Ok(parsed),
        Err(_) if empty => serde_json::from_value(Value::Null)
            .map_err(|e| HandlerError::new(format!("invalid arguments: {e}"))),
        Err(e) => Err(HandlerError::new(format!("invalid arguments: {e}"))),
    }
}
