//! Event pipeline: access check, normalization, device filtering, state
//! cache update, transition notification and persistence.

use hmbridge_db::PersistenceGateway;
use hmbridge_types::{base_device_id, PartialEvent, RpcMethod, EVENT_ARITY};
use hmbridge_xmlrpc::{
    Fault, MethodCall, Value, FAULT_INVALID_REQUEST, FAULT_METHOD_NOT_FOUND,
};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use crate::access::AccessGate;
use crate::notifier::TransitionNotifier;
use crate::state::{CachePolicy, DeviceState, StateCache};

/// Zips positional arguments against `interface, deviceID, param, value`.
///
/// Positions the caller did not send stay empty; arguments past the fourth
/// are ignored.
pub fn normalize(params: &[Value]) -> PartialEvent {
    let mut fields = params.iter().take(EVENT_ARITY).map(Value::to_text);
    PartialEvent {
        interface: fields.next(),
        device_id: fields.next(),
        param: fields.next(),
        value: fields.next(),
    }
}

/// Decides whether an event belongs to a monitored device.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    monitored: HashSet<String>,
}

impl DeviceFilter {
    pub fn new<S: AsRef<str>>(monitored: &[S]) -> Self {
        Self {
            monitored: monitored
                .iter()
                .map(|d| d.as_ref().trim().to_string())
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Tests the base identity of `device_id` against the monitored set.
    pub fn matches(&self, device_id: &str) -> bool {
        self.monitored.contains(base_device_id(device_id))
    }

    /// A record without a device ID is never relevant.
    pub fn is_relevant(&self, event: &PartialEvent) -> bool {
        event.device_id.as_deref().is_some_and(|id| self.matches(id))
    }
}

/// What the pipeline did with one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The caller's address is not allow-listed.
    Unauthorized,
    /// Fewer than four positional arguments.
    Incomplete,
    /// The device is not monitored.
    Irrelevant,
    /// The event went through the stateful stages.
    Processed {
        cached: bool,
        notified: bool,
        persisted: bool,
    },
}

/// The components shared by every listener.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub gate: AccessGate,
    pub filter: DeviceFilter,
    pub policy: CachePolicy,
    pub cache: StateCache,
    pub gateway: PersistenceGateway,
    pub notifier: Option<TransitionNotifier>,
}

impl Pipeline {
    /// Runs a decoded call and produces its XML-RPC result.
    ///
    /// Filtering and authorization decisions never produce a fault. Faults
    /// are reserved for unknown methods and malformed multicall entries.
    pub async fn dispatch(&self, origin: Option<IpAddr>, call: &MethodCall) -> Result<Value, Fault> {
        let method = RpcMethod::from_name(&call.method)
            .map_err(|e| Fault::new(FAULT_METHOD_NOT_FOUND, e.to_string()))?;

        if method == RpcMethod::Multicall {
            return Ok(self.multicall(origin, &call.params).await);
        }
        Ok(self.dispatch_method(origin, method, &call.params).await)
    }

    async fn dispatch_method(&self, origin: Option<IpAddr>, method: RpcMethod, params: &[Value]) -> Value {
        if method.runs_pipeline() {
            self.process(origin, method, params).await;
            return empty_reply(method);
        }

        match method {
            RpcMethod::NewDevices => {
                tracing::debug!(count = params.len(), "newDevices: skipping payload");
                Value::empty_string()
            }
            RpcMethod::GetDeviceStates => {
                if !self.authorize(origin, method) {
                    return Value::empty_struct();
                }
                let device_id = params.first().map(Value::to_text).unwrap_or_default();
                state_to_value(&self.cache.get(&device_id))
            }
            RpcMethod::GetAllDeviceStates => {
                if !self.authorize(origin, method) {
                    return Value::empty_struct();
                }
                let all = self
                    .cache
                    .get_all()
                    .iter()
                    .map(|(device, state)| (device.clone(), state_to_value(state)))
                    .collect();
                Value::Struct(all)
            }
            _ => Fault::new(FAULT_INVALID_REQUEST, "system.multicall cannot be nested").to_value(),
        }
    }

    async fn multicall(&self, origin: Option<IpAddr>, params: &[Value]) -> Value {
        let Some(calls) = params.first().and_then(Value::as_array) else {
            return Fault::new(FAULT_INVALID_REQUEST, "system.multicall expects an array").to_value();
        };

        let mut results = Vec::with_capacity(calls.len());
        for entry in calls {
            let result = match multicall_entry(entry) {
                Ok((RpcMethod::Multicall, _)) => {
                    tracing::warn!("rejected nested system.multicall");
                    Fault::new(FAULT_INVALID_REQUEST, "system.multicall cannot be nested").to_value()
                }
                Ok((method, sub_params)) => Value::Array(vec![
                    self.dispatch_method(origin, method, sub_params).await,
                ]),
                Err(fault) => fault.to_value(),
            };
            results.push(result);
        }
        Value::Array(results)
    }

    fn authorize(&self, origin: Option<IpAddr>, method: RpcMethod) -> bool {
        if self.gate.authorize(origin) {
            return true;
        }
        tracing::warn!(
            origin = ?origin,
            method = %method,
            "rejected call from address outside the allow-list"
        );
        false
    }

    /// Runs one call through the full event pipeline.
    pub async fn process(&self, origin: Option<IpAddr>, method: RpcMethod, params: &[Value]) -> Outcome {
        if !self.authorize(origin, method) {
            return Outcome::Unauthorized;
        }

        let partial = normalize(params);
        tracing::info!(method = %method, event = ?partial, "xml-rpc call received");

        let Some(event) = partial.complete() else {
            tracing::debug!(
                method = %method,
                received = params.len(),
                "incomplete call, skipping stateful processing"
            );
            return Outcome::Incomplete;
        };
        if params.len() > EVENT_ARITY {
            tracing::debug!(method = %method, received = params.len(), "ignoring extra arguments");
        }

        if !self.filter.is_relevant(&partial) {
            tracing::debug!(device_id = %event.device_id, "device not monitored");
            return Outcome::Irrelevant;
        }

        let cached = self.policy.should_cache(&event);
        if cached {
            self.cache.update(&event.device_id, &event.param, &event.value);
        }

        let notified = match &self.notifier {
            Some(notifier) => notifier.notify(&event).await,
            None => false,
        };

        let gateway = self.gateway.clone();
        let persisted = match tokio::task::spawn_blocking(move || gateway.upsert(&event)).await {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::error!(error = %e, "storage task panicked or was cancelled");
                false
            }
        };

        Outcome::Processed {
            cached,
            notified,
            persisted,
        }
    }
}

fn empty_reply(method: RpcMethod) -> Value {
    match method {
        RpcMethod::ListDevices | RpcMethod::SetReadyConfig => Value::empty_array(),
        _ => Value::empty_string(),
    }
}

fn state_to_value(state: &DeviceState) -> Value {
    Value::Struct(
        state
            .iter()
            .map(|(param, value)| (param.clone(), Value::String(value.clone())))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn multicall_entry(entry: &Value) -> Result<(RpcMethod, &[Value]), Fault> {
    let members = entry
        .as_struct()
        .ok_or_else(|| Fault::new(FAULT_INVALID_REQUEST, "multicall entry is not a struct"))?;
    let name = members
        .get("methodName")
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::new(FAULT_INVALID_REQUEST, "multicall entry without methodName"))?;
    let method = RpcMethod::from_name(name)
        .map_err(|e| Fault::new(FAULT_METHOD_NOT_FOUND, e.to_string()))?;
    let params = match members.get("params") {
        Some(Value::Array(params)) => params.as_slice(),
        Some(_) => {
            return Err(Fault::new(
                FAULT_INVALID_REQUEST,
                "multicall params is not an array",
            ))
        }
        None => &[],
    };
    Ok((method, params))
}
