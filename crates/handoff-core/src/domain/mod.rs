//! Domain model (values, envelopes, ids, states, errors).
//!
//! - value: 動的型付けの値（tagged union）
//! - envelope: スレッド間で受け渡す key/value データ
//! - ids: ULID ベースの TaskId / OwnerId
//! - state: TaskHandle の状態遷移
//! - errors: TaskError（producer / consumer / teardown の失敗）

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod state;
pub mod value;

pub use self::envelope::DataEnvelope;
pub use self::errors::TaskError;
pub use self::ids::{OwnerId, TaskId};
pub use self::state::TaskState;
pub use self::value::Value;
