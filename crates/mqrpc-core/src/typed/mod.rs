//! Typed - service method の handler API
//!
//! # 二層構造
//! - **表層（Typed）**: `TypedMethod<A, R, F>` - 引数 tuple と戻り値が型付き
//! - **内部（Dyn）**: `MethodHandler` trait - object-safe, type erasure

pub mod handler;
pub mod registry;

pub use self::handler::{FnMethod, HandlerError, MethodHandler, TypedMethod};
pub use self::registry::{MethodTable, RegistrationError};
