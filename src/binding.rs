// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Lifecycle
//!
//! A binding attaches a producer or a consumer to a destination. Its lifecycle is
//! `Created -> Provisioning -> Active -> Stopping -> Stopped`, with `Failed` as a
//! terminal state reachable from `Provisioning` or `Active`. The state is published
//! on a watch channel so callers can observe it without polling the binder.

use crate::{config::BindingOptions, errors::BinderError};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle state of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingState {
    Created,
    Provisioning,
    Active,
    Stopping,
    Stopped,
    Failed,
}

impl BindingState {
    pub fn can_transition_to(self, next: BindingState) -> bool {
        use BindingState::*;

        matches!(
            (self, next),
            (Created, Provisioning)
                | (Provisioning, Active)
                | (Provisioning, Failed)
                | (Active, Stopping)
                | (Active, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BindingState::Stopped | BindingState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingRole {
    Producer,
    Consumer,
}

/// What to bind: a destination, an optional consumer group and the role.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingSpec {
    destination: String,
    group: Option<String>,
    role: BindingRole,
    options: Option<BindingOptions>,
}

impl BindingSpec {
    pub fn producer(destination: &str) -> Self {
        BindingSpec {
            destination: destination.to_owned(),
            group: None,
            role: BindingRole::Producer,
            options: None,
        }
    }

    /// A consumer on `destination`. Without a group the consumer gets its own
    /// anonymous queue and sees every message (publish-subscribe).
    pub fn consumer(destination: &str, group: Option<&str>) -> Self {
        BindingSpec {
            destination: destination.to_owned(),
            group: group.map(str::to_owned),
            role: BindingRole::Consumer,
            options: None,
        }
    }

    /// Overrides the per-destination options of the binder configuration.
    pub fn with_options(mut self, options: BindingOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn role(&self) -> BindingRole {
        self.role
    }

    pub fn options(&self) -> Option<&BindingOptions> {
        self.options.as_ref()
    }

    /// Checks this binding can be bound as `role`.
    pub fn validate(&self, role: BindingRole) -> Result<(), BinderError> {
        if self.role != role {
            return Err(BinderError::InvalidBindingSpec(format!(
                "`{}` is a {:?} binding",
                self.destination, self.role
            )));
        }

        if self.destination.trim().is_empty() {
            return Err(BinderError::InvalidBindingSpec(
                "destination must not be empty".to_owned(),
            ));
        }

        if let Some(group) = &self.group {
            if group.trim().is_empty() {
                return Err(BinderError::InvalidBindingSpec(
                    "group must not be empty when set".to_owned(),
                ));
            }
        }

        if let Some(options) = &self.options {
            options.validate()?;
        }

        Ok(())
    }

    pub(crate) fn label(&self) -> String {
        match &self.group {
            Some(group) => format!("{}.{}", self.destination, group),
            None => self.destination.clone(),
        }
    }
}

/// Operations shared by producer and consumer handles.
#[async_trait]
pub trait BindingHandle: Send + Sync {
    fn id(&self) -> Uuid;

    fn spec(&self) -> &BindingSpec;

    fn state(&self) -> BindingState;

    /// Stops the binding and releases its channels; broker topology is left in place.
    async fn unbind(&self) -> Result<(), BinderError>;
}

/// Guards the state transitions of one binding.
pub(crate) struct Lifecycle {
    label: String,
    state: watch::Sender<BindingState>,
}

impl Lifecycle {
    pub(crate) fn new(spec: &BindingSpec) -> Self {
        let (state, _) = watch::channel(BindingState::Created);

        Lifecycle {
            label: spec.label(),
            state,
        }
    }

    pub(crate) fn state(&self) -> BindingState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<BindingState> {
        self.state.subscribe()
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn transition(&self, next: BindingState) -> Result<(), BinderError> {
        let mut result = Ok(());

        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(binding = self.label.as_str(), from = ?*current, to = ?next, "binding state changed");
                *current = next;
                true
            } else {
                result = Err(BinderError::InvalidBindingSpec(format!(
                    "illegal transition of `{}` from {:?} to {:?}",
                    self.label, current, next
                )));
                false
            }
        });

        result
    }

    /// Marks the binding `Failed` if it is still provisioning or active.
    pub(crate) fn fail(&self, reason: &BinderError) {
        if self.transition(BindingState::Failed).is_ok() {
            warn!(
                binding = self.label.as_str(),
                error = reason.to_string(),
                "binding failed"
            );
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<(), BinderError> {
        if self.state() == BindingState::Active {
            Ok(())
        } else {
            Err(BinderError::BindingNotActive(self.label.clone()))
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}
