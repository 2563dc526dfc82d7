// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod admin;
pub mod binder;
pub mod binding;
pub mod broker;
pub mod channel;
pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod otel;
pub mod producer;
pub mod provisioner;
pub mod queue;
pub mod topology;

pub use binder::{BinderBuilder, BinderHealth, RabbitMessageChannelBinder};
pub use binding::{BindingHandle, BindingRole, BindingSpec, BindingState};
pub use config::{BinderConfig, BindingOptions, ConsumerOptions, ProducerOptions, RetryPolicy};
pub use consumer::{ConsumerBinding, ConsumerHandler, InboundMessage};
pub use errors::BinderError;
pub use memory::InMemoryBroker;
pub use producer::ProducerBinding;
