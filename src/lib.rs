//! # Weft (v0.1)
//!
//! Declarative application runtime composing a program from four primitive
//! unit kinds - **Tasks**, **Resources**, **Events**, **Hooks** - plus two
//! wrapper kinds, **Middleware** (task- and resource-flavored) and
//! **Tags**. A tree of units registered under a single root resource is
//! booted through Compose → Validate → Wire → Initialize, served through a
//! controlled runtime surface, and torn down in reverse init order.
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`unit`] / [`builders`] | The declarative data model and its fluent constructors |
//! | [`store`] | Unit registry keyed by id, indexed by tag |
//! | [`events`] | Ordered emission, wildcard listeners, cycle guard |
//! | [`task_runner`] | Middleware chains, interceptors, schema validation |
//! | [`boot`] | Tree traversal, overrides, visibility, topological init |
//! | [`surface`] | The public runtime handle with exports enforcement |
//! | [`context`] | Ambient key→value carrier per async chain |
//! | [`sync`] | Semaphore and FIFO queue with cancellation |
//! | [`durable`] | Replay-safe workflow engine over store/queue/bus seams |
//! | [`http`] | Exposure server and tunnel client |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use serde_json::{json, Value};
//! use weft::{boot, builders::{resource, task}, BootOptions};
//!
//! let greet = task("greet")
//!     .run_value(|input: Value, _deps| Ok(json!(format!("hello {}", input))))
//!     .build()?;
//!
//! let app = resource("app").register(vec![greet.into()]).build()?;
//!
//! let runtime = boot(app, BootOptions::new()).await?;
//! let out = runtime.run_task("greet", json!("world")).await?;
//! runtime.dispose().await?;
//! # Ok::<(), weft::WeftError>(())
//! ```

pub mod boot;
pub mod builders;
pub mod context;
pub mod durable;
pub mod error;
pub mod events;
pub mod http;
pub mod kernel;
pub mod logging;
pub mod middleware;
pub mod schema;
pub mod store;
pub mod surface;
pub mod sync;
pub mod tag;
pub mod task_runner;
pub mod types;
pub mod unit;

// Boot and surface
pub use boot::{boot, BootOptions, InitMode, UnhandledError, UnhandledKind};
pub use surface::{Runtime, UnitRef};

// Data model
pub use tag::Tag;
pub use types::{Meta, UnitId, UnitIdError, UnitKind};
pub use unit::{
    DepKind, DependencyRef, DependencySpec, EventDef, HookDef, HookTarget, InitCall,
    MiddlewareAttachment, Next, Registration, ResourceDef, ResourceMiddlewareDef, ResourceValue,
    TaskCall, TaskDef, TaskMiddlewareDef, UnitDef,
};

// Wiring handles
pub use kernel::{Deps, EventEmitter, TaskHandle};

// Events
pub use events::{system, EventEnvelope};

// Errors
pub use error::{format_error_with_hint, FixHint, ValidationTarget, WeftError};

// Context and concurrency
pub use context::Context;
pub use sync::{AbortSignal, DisposeOptions, Queue, Semaphore};

// Durable engine
pub use durable::{
    DurableContext, DurableEngine, DurableError, EngineConfig, ExecuteOptions, Execution,
    ExecutionStatus, Schedule,
};
