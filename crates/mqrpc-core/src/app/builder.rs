//! ServiceBuilder - service 定義の構築
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 構築後は不変（`Arc<[ServiceDescriptor]>`）

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::queue_name;
use crate::typed::{HandlerError, MethodHandler, MethodTable, RegistrationError, TypedMethod};

/// 1 つの remote method の記述
///
/// `(service_name, method_name)` ごとに 1 つの request queue が作られる。
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub service_name: String,
    pub method_name: String,
    pub handler: Arc<dyn MethodHandler>,
}

impl ServiceDescriptor {
    pub fn queue_name(&self) -> String {
        queue_name(&self.service_name, &self.method_name)
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .finish_non_exhaustive()
    }
}

/// 構築済みの service。Dispatcher はこれを読み取り専用の directory として扱う
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    name: String,
    descriptors: Arc<[ServiceDescriptor]>,
}

impl ServiceDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptors(&self) -> &[ServiceDescriptor] {
        &self.descriptors
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.descriptors
            .iter()
            .map(|d| d.method_name.as_str())
            .collect()
    }
}

/// ServiceBuilder は service 定義を構築
///
/// # 使用例
/// ```ignore
/// let text = ServiceBuilder::new("Text")
///     .typed("reverse", |(s,): (String,)| async move {
///         Ok::<_, HandlerError>(s.chars().rev().collect::<String>())
///     })?
///     .expect_methods(&["reverse"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_methods() で remote 公開する method 名を宣言
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
pub struct ServiceBuilder {
    service_name: String,
    methods: MethodTable,
    expected_methods: Option<Vec<String>>,
}

impl ServiceBuilder {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            methods: MethodTable::new(),
            expected_methods: None,
        }
    }

    /// 型名（最後のパス要素）を service 名にする
    pub fn for_type<T: ?Sized>() -> Self {
        Self::new(short_type_name::<T>())
    }

    /// Handler を登録
    pub fn method<H: MethodHandler + 'static>(
        self,
        method: impl Into<String>,
        handler: H,
    ) -> Result<Self, RegistrationError> {
        self.method_arc(method, Arc::new(handler))
    }

    pub fn method_arc(
        mut self,
        method: impl Into<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<Self, RegistrationError> {
        self.methods.register(method, handler)?;
        Ok(self)
    }

    /// 型付きの async 関数を登録
    pub fn typed<A, R, F, Fut>(
        self,
        method: impl Into<String>,
        f: F,
    ) -> Result<Self, RegistrationError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.method(method, TypedMethod::new(f))
    }

    /// remote 公開を期待する method 名を設定
    pub fn expect_methods(mut self, methods: &[&str]) -> Self {
        self.expected_methods = Some(methods.iter().map(|m| m.to_string()).collect());
        self
    }

    /// 検証して ServiceDefinition を生成
    pub fn build(self) -> Result<ServiceDefinition, RegistrationError> {
        if self.service_name.is_empty() {
            return Err(RegistrationError::EmptyName("service"));
        }

        if let Some(expected) = &self.expected_methods {
            let missing: Vec<String> = expected
                .iter()
                .filter(|m| !self.methods.contains(m))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(RegistrationError::MissingMethods {
                    service: self.service_name,
                    missing,
                });
            }
        }

        let service_name = self.service_name;
        let descriptors: Vec<ServiceDescriptor> = self
            .methods
            .into_entries()
            .into_iter()
            .map(|(method_name, handler)| ServiceDescriptor {
                service_name: service_name.clone(),
                method_name,
                handler,
            })
            .collect();

        Ok(ServiceDefinition {
            name: service_name,
            descriptors: descriptors.into(),
        })
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    // ジェネリクス部分は落とす
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
