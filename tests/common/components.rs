#![allow(dead_code)]

//! Test components: a ticking counter, a lagged passthrough, a summation
//! sink, a pulse that aggressively republishes identical exports, and a
//! probe that counts how often it is reconfigured.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tributary::component::{
    Component, ComponentContext, ComponentError, ComponentOptions, Registration, Registry,
    StateChangeFn,
};

fn default_lag() -> Duration {
    Duration::ZERO
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct CountArguments {
    #[serde(with = "tributary::utils::duration")]
    frequency: Duration,
    max: i64,
}

/// Exports an incrementing `count` at a fixed frequency up to `max`.
struct CountComponent {
    args: RwLock<CountArguments>,
    count: AtomicI64,
    publish: StateChangeFn,
}

#[async_trait]
impl Component for CountComponent {
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError> {
        loop {
            let frequency = self.args.read().frequency;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(frequency) => {
                    let max = self.args.read().max;
                    let current = self.count.load(Ordering::Acquire);
                    if current < max {
                        let next = current + 1;
                        self.count.store(next, Ordering::Release);
                        (self.publish)(json!({"count": next}));
                    }
                }
            }
        }
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        *self.args.write() = serde_json::from_value(args)?;
        Ok(())
    }
}

fn build_count(
    opts: ComponentOptions,
    args: Value,
) -> Result<Arc<dyn Component>, ComponentError> {
    let arguments: CountArguments = serde_json::from_value(args)?;
    let component = Arc::new(CountComponent {
        args: RwLock::new(arguments),
        count: AtomicI64::new(0),
        publish: opts.on_state_change.clone(),
    });
    (opts.on_state_change)(json!({"count": 0}));
    Ok(component)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct PassthroughArguments {
    input: Value,
    #[serde(default = "default_lag", with = "tributary::utils::duration")]
    lag: Duration,
}

/// Re-exports its `input` as `output` after an optional lag.
struct PassthroughComponent {
    publish: StateChangeFn,
}

impl PassthroughComponent {
    fn apply(&self, args: PassthroughArguments) {
        let publish = self.publish.clone();
        tokio::spawn(async move {
            if !args.lag.is_zero() {
                tokio::time::sleep(args.lag).await;
            }
            publish(json!({"output": args.input}));
        });
    }
}

#[async_trait]
impl Component for PassthroughComponent {
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError> {
        ctx.cancel.cancelled().await;
        Ok(())
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        let arguments: PassthroughArguments = serde_json::from_value(args)?;
        self.apply(arguments);
        Ok(())
    }
}

fn build_passthrough(
    opts: ComponentOptions,
    args: Value,
) -> Result<Arc<dyn Component>, ComponentError> {
    let arguments: PassthroughArguments = serde_json::from_value(args)?;
    let component = Arc::new(PassthroughComponent {
        publish: opts.on_state_change.clone(),
    });
    // The initial output is published synchronously so dependents can
    // resolve it during the same evaluation pass; the lag only applies to
    // later reconfigurations.
    (component.publish)(json!({"output": arguments.input}));
    Ok(component)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummationArguments {
    input: i64,
}

/// Accumulates every distinct `input` it is updated with, exporting the
/// running `sum` and the `last_added` value.
struct SummationComponent {
    sum: AtomicI64,
    publish: StateChangeFn,
}

impl SummationComponent {
    fn add(&self, input: i64) {
        let sum = self.sum.fetch_add(input, Ordering::AcqRel) + input;
        (self.publish)(json!({"sum": sum, "last_added": input}));
    }
}

#[async_trait]
impl Component for SummationComponent {
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError> {
        ctx.cancel.cancelled().await;
        Ok(())
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        let arguments: SummationArguments = serde_json::from_value(args)?;
        self.add(arguments.input);
        Ok(())
    }
}

fn build_summation(
    opts: ComponentOptions,
    args: Value,
) -> Result<Arc<dyn Component>, ComponentError> {
    let arguments: SummationArguments = serde_json::from_value(args)?;
    let component = Arc::new(SummationComponent {
        sum: AtomicI64::new(0),
        publish: opts.on_state_change.clone(),
    });
    component.add(arguments.input);
    Ok(component)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct PulseArguments {
    #[serde(with = "tributary::utils::duration")]
    frequency: Duration,
}

/// Republishes the same export value on every tick. Downstream nodes must
/// not observe any update after the first.
struct PulseComponent {
    args: RwLock<PulseArguments>,
    publish: StateChangeFn,
}

#[async_trait]
impl Component for PulseComponent {
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError> {
        loop {
            let frequency = self.args.read().frequency;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(frequency) => {
                    (self.publish)(json!({"value": 42}));
                }
            }
        }
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        *self.args.write() = serde_json::from_value(args)?;
        Ok(())
    }
}

fn build_pulse(
    opts: ComponentOptions,
    args: Value,
) -> Result<Arc<dyn Component>, ComponentError> {
    let arguments: PulseArguments = serde_json::from_value(args)?;
    let component = Arc::new(PulseComponent {
        args: RwLock::new(arguments),
        publish: opts.on_state_change.clone(),
    });
    (opts.on_state_change)(json!({"value": 42}));
    Ok(component)
}

/// Global journal of probe reconfigurations, in order, keyed by node-ID.
static PROBE_UPDATES: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// How many times the probe with the given node-ID has been configured
/// since the journal was last reset, the build included.
pub fn probe_updates(id: &str) -> u64 {
    PROBE_UPDATES.lock().iter().filter(|probe| *probe == id).count() as u64
}

/// The order in which probe components were built or reconfigured.
pub fn probe_update_order() -> Vec<String> {
    PROBE_UPDATES.lock().clone()
}

pub fn reset_probes() {
    PROBE_UPDATES.lock().clear();
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProbeArguments {
    input: Value,
}

/// Records every reconfiguration in a global journal and re-exports its
/// input.
struct ProbeComponent {
    id: String,
    publish: StateChangeFn,
}

impl ProbeComponent {
    fn record(&self, input: Value) {
        PROBE_UPDATES.lock().push(self.id.clone());
        (self.publish)(json!({"output": input}));
    }
}

#[async_trait]
impl Component for ProbeComponent {
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError> {
        ctx.cancel.cancelled().await;
        Ok(())
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        let arguments: ProbeArguments = serde_json::from_value(args)?;
        self.record(arguments.input);
        Ok(())
    }
}

fn build_probe(opts: ComponentOptions, args: Value) -> Result<Arc<dyn Component>, ComponentError> {
    let arguments: ProbeArguments = serde_json::from_value(args)?;
    let component = Arc::new(ProbeComponent {
        id: opts.id.clone(),
        publish: opts.on_state_change.clone(),
    });
    component.record(arguments.input);
    Ok(component)
}

/// The builtin registry extended with every `testkit.*` component.
pub fn test_registry() -> Arc<Registry> {
    let mut registry = Registry::with_builtins();
    for registration in [
        Registration {
            name: "testkit.count",
            build: build_count,
        },
        Registration {
            name: "testkit.passthrough",
            build: build_passthrough,
        },
        Registration {
            name: "testkit.summation",
            build: build_summation,
        },
        Registration {
            name: "testkit.pulse",
            build: build_pulse,
        },
        Registration {
            name: "testkit.probe",
            build: build_probe,
        },
    ] {
        registry.register(registration).expect("unique test registrations");
    }
    Arc::new(registry)
}
