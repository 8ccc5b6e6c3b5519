//! handoff-core
//!
//! Run a slow producer on a dedicated thread and hand its result back to the
//! caller's thread without blocking it.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（value, envelope, ids, state, errors）
//! - **config**: TaskConfig（label, teardown timeout, stack size）
//! - **worker**: WorkerUnit（producer を一度だけ実行してイベントを送る）
//! - **context**: ExecutionContext（WorkerUnit を載せる専用スレッド）
//! - **event_loop**: EventLoop / LoopHandle（呼び出し側スレッドでの配送）
//! - **handle**: TaskHandle / TaskBuilder（公開 API）
//! - **owner**: TaskOwner（明示的な所有ツリー）
//!
//! # Example
//! ```ignore
//! let mut event_loop = EventLoop::new();
//! let _task = TaskHandle::spawn(
//!     &event_loop.handle(),
//!     || DataEnvelope::new().with("x", 1),
//!     |data| println!("x = {:?}", data.get_i64("x")),
//! )?;
//! event_loop.run_until_idle().await;
//! ```

pub mod config;
pub mod context;
pub mod domain;
pub mod event_loop;
pub mod handle;
pub mod owner;
pub mod worker;

pub use self::config::{ConfigError, TaskConfig};
pub use self::context::{ContextPhase, ExecutionContext, live_threads};
pub use self::domain::{DataEnvelope, OwnerId, TaskError, TaskId, TaskState, Value};
pub use self::event_loop::{Dispatch, EventLoop, LoopHandle};
pub use self::handle::{TaskBuilder, TaskHandle};
pub use self::owner::TaskOwner;
pub use self::worker::{ProducerOutput, WorkerEvent, WorkerUnit};
