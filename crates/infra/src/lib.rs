//! Infrastructure layer: identity storage, task dispatch/consumption, brokers
//! and the user service that ties them together.

pub mod broker;
pub mod identity_store;
pub mod retry;
pub mod scheduler;
pub mod task_consumer;
pub mod task_dispatcher;
pub mod user_service;
pub mod user_tasks;

mod integration_tests;

pub use identity_store::{InMemoryUserStore, PostgresUserStore, StoreError, UserStore};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::Scheduler;
pub use task_consumer::{
    ConsumerStats, HandlerError, HandlerRegistry, TaskConsumer, TaskConsumerConfig, TaskConsumerHandle,
    TaskError, TaskHandler, TaskOutcome,
};
pub use task_dispatcher::{DispatchError, TaskDispatcher};
pub use user_service::{UserAuth, UserError, UserService};
pub use user_tasks::{CREATE_TASK, CreateUserHandler, USER_EXCHANGE, register_user_handlers};
