//! MethodTable - method 名と handler の対応表
//!
//! # 学習ポイント
//! - HashMap での型消去された trait object の管理
//! - Arc による共有所有権（Dispatcher の consumer loop へ渡す）
//! - 登録順を保つため名前の Vec も持つ

use super::handler::MethodHandler;
use std::collections::HashMap;
use std::sync::Arc;

/// RegistrationError は service 定義時のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("method '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("service '{service}' has no method(s) {missing:?}")]
    MissingMethods { service: String, missing: Vec<String> },

    #[error("{0} name must not be empty")]
    EmptyName(&'static str),
}

/// MethodTable は method 名ごとに handler を 1 つだけ持つ
#[derive(Default, Clone)]
pub struct MethodTable {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    order: Vec<String>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<(), RegistrationError> {
        let method = method.into();
        if method.is_empty() {
            return Err(RegistrationError::EmptyName("method"));
        }
        if self.handlers.contains_key(&method) {
            return Err(RegistrationError::AlreadyRegistered(method));
        }
        self.order.push(method.clone());
        self.handlers.insert(method, handler);
        Ok(())
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// 登録順の method 名
    pub fn registered_methods(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 登録順に (method 名, handler) を取り出す
    pub fn into_entries(mut self) -> Vec<(String, Arc<dyn MethodHandler>)> {
        self.order
            .into_iter()
            .filter_map(|name| self.handlers.remove(&name).map(|h| (name, h)))
            .collect()
    }
}
