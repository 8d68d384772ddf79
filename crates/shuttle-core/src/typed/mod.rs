//! Typed - 型付き Job API
//!
//! job_type の typo を型で排除し、payload の JSON decode を handler 境界の
//! 内側に閉じ込めます。キュー本体は payload を bytes としてしか扱いません。
//!
//! # 二層構造
//! - **表層（Typed）**: `JobKind` trait, `TypedHandler<T>` trait - 型安全
//! - **内部（Dyn）**: `runtime::JobHandler` - object-safe, type erasure

pub mod codec;
pub mod handler;
pub mod kind;
pub mod registry;

pub use self::codec::{CodecError, decode_payload, encode_payload};
pub use self::handler::{Typed, TypedHandler};
pub use self::kind::JobKind;
