//! The plan/apply engine: the crate's top-level entry points.
//!
//! A [`Lattice`] holds the registered providers and drives whole
//! rounds: [`Lattice::plan`] builds the dependency graph from a
//! configuration and prior state, walks it, and assembles a [`Plan`];
//! [`Lattice::apply`] walks the same shape again carrying that plan's
//! changes out against the providers and returns the updated state.

mod visit;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::addrs::{AbsResourceInstance, ModuleInstance, Target};
use crate::config::Config;
use crate::defer::DeferralTracker;
use crate::error::{Diagnostic, Diagnostics, LatticeError};
use crate::eval::EvalData;
use crate::expand::Expander;
use crate::graph::{
    build_graph, walk, GraphPurpose, TransformContext, WalkOptions, WalkSignal,
};
use crate::plan::{Action, CheckResults, OutputChange, Plan, PlanMode, SharedCheckResults};
use crate::provider::Provider;
use crate::state::{generate_holder_id, State, StateLock, SyncState};
use crate::value::Value;

use visit::{EngineContext, EngineVisitor, Phase};

/// Default number of nodes visited concurrently during a walk.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Options for one planning round.
#[derive(Debug)]
pub struct PlanOpts {
    /// The planning mode.
    pub mode: PlanMode,
    /// Root module input variable values supplied by the caller.
    pub variables: BTreeMap<String, Value>,
    /// Restrict planning to these targets and their dependencies.
    pub targets: Vec<Target>,
    /// Instances whose replacement the caller demands regardless of
    /// what the diff would otherwise decide.
    pub force_replace: Vec<AbsResourceInstance>,
    /// Whether undecidable work may be deferred to a later round
    /// instead of failing the plan.
    pub deferrals_allowed: bool,
    /// Maximum concurrent node visits.
    pub parallelism: usize,
    /// External control signal for graceful stop or cancellation.
    pub signal: Option<watch::Receiver<WalkSignal>>,
}

impl Default for PlanOpts {
    fn default() -> Self {
        Self {
            mode: PlanMode::Normal,
            variables: BTreeMap::new(),
            targets: Vec::new(),
            force_replace: Vec::new(),
            deferrals_allowed: true,
            parallelism: DEFAULT_PARALLELISM,
            signal: None,
        }
    }
}

/// Options for one apply round.
#[derive(Debug)]
pub struct ApplyOpts {
    /// Maximum concurrent node visits.
    pub parallelism: usize,
    /// External control signal for graceful stop or cancellation.
    pub signal: Option<watch::Receiver<WalkSignal>>,
}

impl Default for ApplyOpts {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            signal: None,
        }
    }
}

/// The engine itself: a registry of providers plus the plan and apply
/// entry points.
#[derive(Default)]
pub struct Lattice {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    state_lock: StateLock,
}

impl Lattice {
    /// Creates an engine with no providers registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under a name, builder style.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register_provider(name, provider);
        self
    }

    /// Registers a provider under a name.
    pub fn register_provider(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Plans one round: refreshes prior objects, diffs the desired
    /// configuration against them, and returns the proposed changes
    /// along with every diagnostic raised on the way.
    ///
    /// The returned plan is marked incomplete when any work had to be
    /// deferred; applying it converges the infrastructure but another
    /// plan round is needed afterwards.
    pub async fn plan(
        &self,
        config: &Config,
        state: &State,
        opts: PlanOpts,
    ) -> (Plan, Diagnostics) {
        let PlanOpts {
            mode,
            variables,
            targets,
            force_replace,
            deferrals_allowed,
            parallelism,
            signal,
        } = opts;
        let mut diags = Diagnostics::new();

        // Held until this round returns; a concurrent round fails fast.
        let guard = match self.state_lock.acquire(&generate_holder_id(), "plan") {
            Ok(guard) => guard,
            Err(err) => {
                diags.push_error(&LatticeError::State(err));
                return (errored_plan(mode, variables), diags);
            }
        };
        debug!(lock_id = %guard.info().lock_id, holder = %guard.info().holder, "planning round started");

        let tctx = TransformContext {
            config,
            state,
            purpose: GraphPurpose::Plan,
            mode,
            targets: &targets,
        };
        let Some(graph) = build_graph(&tctx, &mut diags) else {
            return (errored_plan(mode, variables), diags);
        };

        let ctx = Arc::new(EngineContext {
            eval: EvalData::new(
                Arc::new(config.clone()),
                SyncState::new(state.clone()),
                Arc::new(Expander::new()),
            ),
            providers: self.providers.clone(),
            provider_configs: Mutex::new(BTreeMap::new()),
            unknown_providers: Mutex::new(BTreeSet::new()),
            tracker: DeferralTracker::new(deferrals_allowed),
            checks: SharedCheckResults::new(),
            drift: Mutex::new(Vec::new()),
            phase: Phase::Plan,
            mode,
            variables: variables.clone(),
            targets,
            force_replace,
            plan_changes: BTreeMap::new(),
            imports: import_index(config),
        });
        let visitor = Arc::new(EngineVisitor::new(Arc::clone(&ctx)));
        let report = walk(
            graph,
            visitor,
            WalkOptions {
                parallelism,
                error_tolerant: mode == PlanMode::RefreshOnly,
                signal,
            },
        )
        .await;
        diags.extend(report.diagnostics);

        let changes = ctx.eval.changes.take_changes();
        let deferred = ctx.tracker.take_deferred_changes();
        let mut drift = std::mem::take(&mut *lock(&ctx.drift));
        drift.sort_by_key(|c| c.addr.to_string());
        let output_changes = output_changes(config, state, &ctx.eval.named.root_outputs());
        let errored = diags.has_errors();
        let complete = report.completed && deferred.is_empty() && !errored;

        let plan = Plan {
            mode,
            complete,
            errored,
            variables,
            changes,
            drift,
            deferred,
            output_changes,
            checks: ctx.checks.snapshot(),
            timestamp: Utc::now(),
        };
        info!(%plan, complete, "planning round finished");
        (plan, diags)
    }

    /// Applies a plan: walks the graph again, carrying out each planned
    /// change with apply-time values, and returns the resulting state.
    ///
    /// The input state must be the one the plan was made against;
    /// changes are re-planned per instance before being applied, so
    /// values unknown during planning resolve here.
    pub async fn apply(
        &self,
        config: &Config,
        plan: &Plan,
        state: &State,
        opts: ApplyOpts,
    ) -> (State, Diagnostics) {
        let mut diags = Diagnostics::new();
        if !plan.applyable() {
            diags.push(Diagnostic::error(
                "Cannot apply this plan",
                "The plan finished with errors, so it may not be applied.",
            ));
            return (state.clone(), diags);
        }

        let guard = match self.state_lock.acquire(&generate_holder_id(), "apply") {
            Ok(guard) => guard,
            Err(err) => {
                diags.push_error(&LatticeError::State(err));
                return (state.clone(), diags);
            }
        };
        debug!(lock_id = %guard.info().lock_id, holder = %guard.info().holder, "apply round started");

        let tctx = TransformContext {
            config,
            state,
            purpose: GraphPurpose::Plan,
            mode: plan.mode,
            targets: &[],
        };
        let Some(graph) = build_graph(&tctx, &mut diags) else {
            return (state.clone(), diags);
        };

        let plan_changes = plan
            .changes
            .iter()
            .map(|c| (c.addr.clone(), c.clone()))
            .collect();
        let ctx = Arc::new(EngineContext {
            eval: EvalData::new(
                Arc::new(config.clone()),
                SyncState::new(state.clone()),
                Arc::new(Expander::new()),
            ),
            providers: self.providers.clone(),
            provider_configs: Mutex::new(BTreeMap::new()),
            unknown_providers: Mutex::new(BTreeSet::new()),
            tracker: DeferralTracker::new(false),
            checks: SharedCheckResults::new(),
            drift: Mutex::new(Vec::new()),
            phase: Phase::Apply,
            mode: plan.mode,
            variables: plan.variables.clone(),
            targets: Vec::new(),
            force_replace: Vec::new(),
            plan_changes,
            imports: import_index(config),
        });
        let visitor = Arc::new(EngineVisitor::new(Arc::clone(&ctx)));
        let report = walk(
            graph,
            visitor,
            WalkOptions {
                parallelism: opts.parallelism,
                error_tolerant: false,
                signal: opts.signal,
            },
        )
        .await;
        diags.extend(report.diagnostics);
        if diags.has_errors() {
            warn!("apply round finished with errors");
        }

        // Record root output values, dropping declarations that no
        // longer exist. Values still unknown (a partial apply) keep
        // whatever the state already records.
        let evaluated = ctx.eval.named.root_outputs();
        ctx.eval
            .state
            .write(|s| {
                for (name, value) in &evaluated {
                    if value.has_unknown() {
                        continue;
                    }
                    s.set_output(name.clone(), value.clone());
                }
                let stale: Vec<String> = s
                    .outputs()
                    .keys()
                    .filter(|name| !config.root.outputs.contains_key(*name))
                    .cloned()
                    .collect();
                for name in stale {
                    s.set_output(name, Value::null());
                }
            })
            .await;

        (ctx.eval.state.snapshot().await, diags)
    }

    /// Validates a configuration without state or providers: reference
    /// analysis, graph construction, and cycle detection.
    #[must_use]
    pub fn validate(&self, config: &Config) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let state = State::new();
        let tctx = TransformContext {
            config,
            state: &state,
            purpose: GraphPurpose::Validate,
            mode: PlanMode::Normal,
            targets: &[],
        };
        let _ = build_graph(&tctx, &mut diags);
        diags
    }
}

/// The plan produced when graph construction itself fails.
fn errored_plan(mode: PlanMode, variables: BTreeMap<String, Value>) -> Plan {
    Plan {
        mode,
        complete: false,
        errored: true,
        variables,
        changes: Vec::new(),
        drift: Vec::new(),
        deferred: Vec::new(),
        output_changes: Vec::new(),
        checks: CheckResults::new(),
        timestamp: Utc::now(),
    }
}

/// Diffs the root module's evaluated outputs against the prior state.
fn output_changes(
    config: &Config,
    state: &State,
    evaluated: &BTreeMap<String, Value>,
) -> Vec<OutputChange> {
    let mut out = Vec::new();
    for (name, decl) in &config.root.outputs {
        let after = evaluated
            .get(name)
            .cloned()
            .unwrap_or_else(Value::unknown);
        let before = state
            .outputs()
            .get(name)
            .cloned()
            .unwrap_or_else(Value::null);
        let action = if before.is_null() && after.is_null() {
            Action::NoOp
        } else if before.is_null() {
            Action::Create
        } else if after.is_null() {
            Action::Delete
        } else if before == after {
            Action::NoOp
        } else {
            Action::Update
        };
        out.push(OutputChange {
            name: name.clone(),
            action,
            before,
            after,
            sensitive: decl.sensitive,
        });
    }
    for (name, before) in state.outputs() {
        if !config.root.outputs.contains_key(name) {
            out.push(OutputChange {
                name: name.clone(),
                action: Action::Delete,
                before: before.clone(),
                after: Value::null(),
                sensitive: false,
            });
        }
    }
    out
}

/// Instances the root module's import blocks want adopted, by address.
fn import_index(config: &Config) -> BTreeMap<AbsResourceInstance, String> {
    config
        .root
        .imports
        .iter()
        .map(|imp| {
            let addr = imp
                .to
                .absolute(ModuleInstance::root())
                .instance(imp.key.clone());
            (addr, imp.id.clone())
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addrs::{InstanceKey, ModuleInstance, Reference, Resource};
    use crate::config::{
        Condition, Expr, ImportTarget, Module, ModuleCall, OutputConfig, RemovedBlock,
        Repetition, ResourceConfig, VariableConfig,
    };
    use crate::defer::DeferredReason;
    use crate::plan::{ActionReason, CheckStatus};
    use crate::provider::MockProvider;
    use crate::state::{ObjectStatus, ResourceInstanceObject};
    use crate::value::ValueKind;

    fn engine(provider: &Arc<MockProvider>) -> Lattice {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        Lattice::new().with_provider("test", Arc::clone(provider) as Arc<dyn Provider>)
    }

    fn instance(name: &str, key: InstanceKey) -> AbsResourceInstance {
        Resource::managed("test_thing", name)
            .absolute(ModuleInstance::root())
            .instance(key)
    }

    fn obj(pairs: &[(&str, Expr)]) -> Expr {
        Expr::Object(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    fn counted_config() -> Config {
        let mut root = Module::new();
        root.add_variable(VariableConfig {
            name: String::from("n"),
            default: Some(Value::int(3)),
            sensitive: false,
        });
        root.add_resource(
            ResourceConfig::managed("test_thing", "a")
                .with_repetition(Repetition::Count(Expr::reference(Reference::InputVariable(
                    String::from("n"),
                ))))
                .with_config(obj(&[("index", Expr::reference(Reference::CountIndex))])),
        );
        Config::new(root)
    }

    fn zoned_config(zone: &str, create_before_destroy: bool) -> Config {
        let mut root = Module::new();
        let mut rc = ResourceConfig::managed("test_thing", "a")
            .with_config(obj(&[("zone", Expr::str(zone))]));
        if create_before_destroy {
            rc = rc.with_create_before_destroy();
        }
        root.add_resource(rc);
        Config::new(root)
    }

    fn linked_config() -> Config {
        let a_ref = || Expr::reference(Reference::Resource(Resource::managed("test_thing", "a")));
        let mut root = Module::new();
        root.add_resource(
            ResourceConfig::managed("test_thing", "a")
                .with_config(obj(&[("name", Expr::str("a"))])),
        );
        root.add_resource(
            ResourceConfig::managed("test_thing", "b")
                .with_config(obj(&[("upstream", a_ref().attr("id"))])),
        );
        root.add_output(OutputConfig {
            name: String::from("a_id"),
            value: a_ref().attr("id"),
            sensitive: false,
        });
        Config::new(root)
    }

    #[tokio::test]
    async fn test_counted_create_then_stable_replan() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = counted_config();

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(plan.complete);
        assert_eq!(plan.changes.len(), 3);
        assert!(plan.changes.iter().all(|c| c.action == Action::Create));

        let (state, diags) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(state.all_instance_addrs().len(), 3);

        let (replan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(replan.complete);
        assert!(replan.is_empty(), "{replan}");
        assert!(replan.drift.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_count_defers_whole_resource() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = counted_config();

        let mut variables = BTreeMap::new();
        variables.insert(String::from("n"), Value::unknown());
        let (plan, diags) = engine
            .plan(
                &config,
                &State::new(),
                PlanOpts {
                    variables,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(!plan.complete);
        assert!(plan.changes.is_empty());
        assert_eq!(plan.deferred.len(), 1);
        let deferred = &plan.deferred[0];
        assert_eq!(deferred.reason, DeferredReason::InstanceCountUnknown);
        assert_eq!(deferred.display_addr(), "test_thing.a[\"*\"]");
        assert_eq!(deferred.change.action, Action::Create);

        // With the count supplied the next round plans it fully.
        let mut variables = BTreeMap::new();
        variables.insert(String::from("n"), Value::int(2));
        let (plan, _) = engine
            .plan(
                &config,
                &State::new(),
                PlanOpts {
                    variables,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(plan.complete);
        assert_eq!(plan.changes.len(), 2);
    }

    #[tokio::test]
    async fn test_cross_resource_reference_resolves_at_apply() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = linked_config();

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(plan.complete);
        let b = plan
            .changes
            .iter()
            .find(|c| c.addr == instance("b", InstanceKey::NoKey))
            .unwrap();
        assert!(b.after.get_attr("upstream").unwrap().is_unknown());

        let (state, diags) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let a_id = state
            .instance(&instance("a", InstanceKey::NoKey))
            .unwrap()
            .value
            .get_attr("id")
            .unwrap();
        let b_upstream = state
            .instance(&instance("b", InstanceKey::NoKey))
            .unwrap()
            .value
            .get_attr("upstream")
            .unwrap();
        assert_eq!(a_id, b_upstream);
        assert_eq!(state.outputs().get("a_id"), Some(&a_id));

        let (replan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(replan.is_empty(), "{replan}");
    }

    #[tokio::test]
    async fn test_data_source_value_flows_into_plan() {
        let provider = Arc::new(
            MockProvider::new("test").with_data_value(
                "data.test_info.x",
                Value::map(BTreeMap::from([(
                    String::from("tier"),
                    Value::string("gold"),
                )])),
            ),
        );
        let engine = engine(&provider);

        let mut root = Module::new();
        root.add_resource(
            ResourceConfig::data("test_info", "x").with_config(obj(&[("tier", Expr::str("?"))])),
        );
        root.add_resource(ResourceConfig::managed("test_thing", "b").with_config(obj(&[(
            "tier",
            Expr::reference(Reference::Resource(Resource::data("test_info", "x"))).attr("tier"),
        )])));
        let config = Config::new(root);

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        let b = plan
            .changes
            .iter()
            .find(|c| c.addr == instance("b", InstanceKey::NoKey))
            .unwrap();
        assert_eq!(b.action, Action::Create);
        assert_eq!(b.after.get_attr("tier"), Some(Value::string("gold")));
        assert_eq!(plan.real_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_force_replace_key_mismatch_warns() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = counted_config();
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    force_replace: vec![instance("a", InstanceKey::NoKey)],
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let warnings = diags.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].detail.contains("-replace=\"test_thing.a[0]\""));
        assert!(plan.changes.iter().all(|c| c.action == Action::NoOp));
    }

    #[tokio::test]
    async fn test_forced_replacement() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = counted_config();
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let target = instance("a", InstanceKey::Index(0));
        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    force_replace: vec![target.clone()],
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let forced = plan.changes.iter().find(|c| c.addr == target).unwrap();
        assert_eq!(forced.action, Action::DeleteThenCreate);
        assert_eq!(forced.action_reason, Some(ActionReason::ReplaceByRequest));
        assert_eq!(plan.real_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_replace_forcing_attribute() {
        let provider = Arc::new(MockProvider::new("test").with_requires_replace(&["zone"]));
        let engine = engine(&provider);
        let (plan, _) = engine
            .plan(&zoned_config("a", false), &State::new(), PlanOpts::default())
            .await;
        let (state, _) = engine
            .apply(&zoned_config("a", false), &plan, &State::new(), ApplyOpts::default())
            .await;

        let (plan, diags) = engine
            .plan(&zoned_config("b", false), &state, PlanOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let change = &plan.changes[0];
        assert_eq!(change.action, Action::DeleteThenCreate);
        assert_eq!(
            change.action_reason,
            Some(ActionReason::ReplaceBecauseCannotUpdate)
        );
        assert_eq!(change.required_replace, vec![String::from("zone")]);
    }

    #[tokio::test]
    async fn test_create_before_destroy_replacement() {
        let provider = Arc::new(MockProvider::new("test").with_requires_replace(&["zone"]));
        let engine = engine(&provider);
        let (plan, _) = engine
            .plan(&zoned_config("a", true), &State::new(), PlanOpts::default())
            .await;
        let (state, _) = engine
            .apply(&zoned_config("a", true), &plan, &State::new(), ApplyOpts::default())
            .await;

        let config = zoned_config("b", true);
        let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(plan.changes[0].action, Action::CreateThenDelete);

        let (state, diags) = engine
            .apply(&config, &plan, &state, ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(state.all_instance_addrs().len(), 1);
        let value = &state
            .instance(&instance("a", InstanceKey::NoKey))
            .unwrap()
            .value;
        assert_eq!(value.get_attr("zone"), Some(Value::string("b")));
    }

    #[tokio::test]
    async fn test_tainted_object_plans_replacement() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = zoned_config("a", false);
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (mut state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        state.taint_instance(&instance("a", InstanceKey::NoKey));

        let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        let change = &plan.changes[0];
        assert_eq!(change.action, Action::DeleteThenCreate);
        assert_eq!(change.action_reason, Some(ActionReason::ReplaceBecauseTainted));
    }

    #[tokio::test]
    async fn test_orphaned_module_instance_is_destroyed() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let addr = Resource::managed("test_thing", "a")
            .absolute(ModuleInstance::root().child("net", InstanceKey::NoKey))
            .instance(InstanceKey::NoKey);
        let mut state = State::new();
        state.set_instance(
            addr.clone(),
            ResourceInstanceObject::ready(Value::map(BTreeMap::from([(
                String::from("id"),
                Value::string("test-1"),
            )]))),
        );

        let config = Config::new(Module::new());
        let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].action, Action::Delete);
        assert_eq!(
            plan.changes[0].action_reason,
            Some(ActionReason::DeleteBecauseNoModule)
        );

        let (state, diags) = engine
            .apply(&config, &plan, &state, ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_shrunk_count_orphans_extra_instances() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = counted_config();
        let mut variables = BTreeMap::new();
        variables.insert(String::from("n"), Value::int(2));
        let opts = || PlanOpts {
            variables: variables.clone(),
            ..PlanOpts::default()
        };
        let (plan, _) = engine.plan(&config, &State::new(), opts()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let mut variables = BTreeMap::new();
        variables.insert(String::from("n"), Value::int(1));
        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    variables,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(plan.changes.len(), 2);
        let gone = plan
            .changes
            .iter()
            .find(|c| c.addr == instance("a", InstanceKey::Index(1)))
            .unwrap();
        assert_eq!(gone.action, Action::Delete);
        assert_eq!(
            gone.action_reason,
            Some(ActionReason::DeleteBecauseWrongRepetition)
        );
        let kept = plan
            .changes
            .iter()
            .find(|c| c.addr == instance("a", InstanceKey::Index(0)))
            .unwrap();
        assert_eq!(kept.action, Action::NoOp);
    }

    #[tokio::test]
    async fn test_removed_block_forgets_without_destroying() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = zoned_config("a", false);
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let mut root = Module::new();
        root.removed.push(RemovedBlock {
            from: Resource::managed("test_thing", "a"),
            destroy: false,
        });
        let config = Config::new(root);

        // Fresh provider so the operation log covers only this round.
        let provider = Arc::new(MockProvider::new("test"));
        let engine = Lattice::new().with_provider("test", Arc::clone(&provider) as Arc<dyn Provider>);
        let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(diags.warnings().len(), 1);
        assert_eq!(plan.changes.len(), 1);
        assert_eq!(plan.changes[0].action, Action::Forget);
        assert_eq!(
            plan.changes[0].action_reason,
            Some(ActionReason::ForgetBecauseRemoved)
        );

        let (state, diags) = engine
            .apply(&config, &plan, &state, ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(state.all_instance_addrs().is_empty());
        assert!(provider.operations().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_only_records_drift() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = zoned_config("a", false);
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let mut drifted = state
            .instance(&instance("a", InstanceKey::NoKey))
            .unwrap()
            .value
            .clone();
        if let ValueKind::Map(entries) = &mut drifted.kind {
            entries.insert(String::from("zone"), Value::string("z"));
        }
        provider.script_read("test_thing.a", Some(drifted.clone()));

        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    mode: PlanMode::RefreshOnly,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(plan.changes.is_empty());
        assert_eq!(plan.drift.len(), 1);
        assert_eq!(plan.drift[0].action, Action::Update);
        assert_eq!(plan.drift[0].after, drifted);
    }

    #[tokio::test]
    async fn test_destroy_round_empties_state() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = linked_config();
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    mode: PlanMode::Destroy,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(plan.complete);
        assert_eq!(plan.changes.len(), 2);
        assert!(plan.changes.iter().all(|c| c.action == Action::Delete));
        let output = plan
            .output_changes
            .iter()
            .find(|c| c.name == "a_id")
            .unwrap();
        assert_eq!(output.action, Action::Delete);

        let (state, diags) = engine
            .apply(&config, &plan, &state, ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_plan_refused_while_state_locked() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = zoned_config("a", false);

        let _held = engine
            .state_lock
            .acquire("another-session", "apply")
            .unwrap();
        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(plan.errored);
        assert!(diags.has_errors());
        assert!(diags
            .errors()
            .iter()
            .any(|d| d.detail.contains("locked by another")));
        assert!(provider.operations().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_between_rounds() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = zoned_config("a", false);

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        let (_, diags) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(engine.state_lock.current().is_none());
    }

    #[tokio::test]
    async fn test_destroy_removes_dependents_before_dependencies() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = linked_config();
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, diags) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");

        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    mode: PlanMode::Destroy,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let (state, diags) = engine
            .apply(&config, &plan, &state, ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(state.is_empty());

        // b consumes a, so b's destroy must land first.
        let ops = provider.operations();
        let destroy_b = ops.iter().rposition(|op| op == "apply test_thing.b").unwrap();
        let destroy_a = ops.iter().rposition(|op| op == "apply test_thing.a").unwrap();
        assert!(destroy_b < destroy_a, "{ops:?}");
    }

    #[tokio::test]
    async fn test_destroy_targeting_includes_dependents() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let config = linked_config();
        let (plan, _) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        let (state, _) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;

        let target = Target::Resource(
            Resource::managed("test_thing", "a").absolute(ModuleInstance::root()),
        );
        let (plan, diags) = engine
            .plan(
                &config,
                &state,
                PlanOpts {
                    mode: PlanMode::Destroy,
                    targets: vec![target],
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let addrs: Vec<String> = plan
            .real_changes()
            .iter()
            .map(|c| c.addr.to_string())
            .collect();
        assert!(addrs.contains(&String::from("test_thing.a")));
        assert!(addrs.contains(&String::from("test_thing.b")));
    }

    #[tokio::test]
    async fn test_import_adopts_existing_object() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);

        let mut root = Module::new();
        root.add_resource(
            ResourceConfig::managed("test_thing", "a")
                .with_config(obj(&[("name", Expr::str("a"))])),
        );
        root.add_import(ImportTarget {
            to: Resource::managed("test_thing", "a"),
            key: InstanceKey::NoKey,
            id: String::from("ext-9"),
        });
        let config = Config::new(root);

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        let change = plan
            .changes
            .iter()
            .find(|c| c.addr == instance("a", InstanceKey::NoKey))
            .unwrap();
        assert_eq!(change.importing.as_deref(), Some("ext-9"));
        assert_eq!(change.action, Action::Update);
        assert_eq!(change.before.get_attr("id"), Some(Value::string("ext-9")));

        let (state, diags) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        let object = state.instance(&instance("a", InstanceKey::NoKey)).unwrap();
        // The adopted id survives the follow-up update.
        assert_eq!(object.value.get_attr("id"), Some(Value::string("ext-9")));
        assert_eq!(object.value.get_attr("name"), Some(Value::string("a")));
        let imports = provider
            .operations()
            .iter()
            .filter(|op| op.as_str() == "import test_thing[ext-9]")
            .count();
        assert_eq!(imports, 2);
    }

    #[tokio::test]
    async fn test_failed_apply_taints_for_replacement() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);
        let (plan, _) = engine
            .plan(&zoned_config("a", false), &State::new(), PlanOpts::default())
            .await;
        let (state, _) = engine
            .apply(&zoned_config("a", false), &plan, &State::new(), ApplyOpts::default())
            .await;

        let config = zoned_config("b", false);
        let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(plan.changes[0].action, Action::Update);

        provider.script_apply_failure("test_thing.a");
        let (state, diags) = engine
            .apply(&config, &plan, &state, ApplyOpts::default())
            .await;
        assert!(diags.has_errors());
        assert!(diags
            .errors()
            .iter()
            .any(|d| d.detail.contains("failed during apply")));
        let object = state.instance(&instance("a", InstanceKey::NoKey)).unwrap();
        assert_eq!(object.status, ObjectStatus::Tainted);

        let (plan, diags) = engine.plan(&config, &state, PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(plan.changes[0].action, Action::DeleteThenCreate);
        assert_eq!(
            plan.changes[0].action_reason,
            Some(ActionReason::ReplaceBecauseTainted)
        );
    }

    #[tokio::test]
    async fn test_precondition_checked_per_instance() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);

        let mut members = BTreeMap::new();
        members.insert(String::from("good"), Value::bool(true));
        members.insert(String::from("bad"), Value::bool(false));
        let mut rc = ResourceConfig::managed("test_thing", "c")
            .with_repetition(Repetition::ForEach(Expr::lit(Value::map(members))))
            .with_config(obj(&[("flag", Expr::reference(Reference::EachValue))]));
        rc.preconditions.push(Condition {
            condition: Expr::reference(Reference::EachValue),
            error_message: String::from("the member value must be true"),
        });
        let mut root = Module::new();
        root.add_resource(rc);
        let config = Config::new(root);

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(diags.has_errors());
        assert!(plan.errored);
        let results = plan.checks.configs.get("test_thing.c").unwrap();
        assert_eq!(results.status(), CheckStatus::Fail);
        let bad = results.objects.get("test_thing.c[\"bad\"]").unwrap();
        assert_eq!(bad.status, CheckStatus::Fail);
        assert_eq!(
            bad.failure_messages,
            vec![String::from("the member value must be true")]
        );
        let good = results.objects.get("test_thing.c[\"good\"]").unwrap();
        assert_eq!(good.status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn test_counted_module_call_expands_and_exports() {
        let provider = Arc::new(MockProvider::new("test"));
        let engine = engine(&provider);

        let mut child = Module::new();
        child.add_variable(VariableConfig {
            name: String::from("base"),
            default: None,
            sensitive: false,
        });
        child.add_resource(
            ResourceConfig::managed("test_thing", "inner").with_config(obj(&[(
                "base",
                Expr::reference(Reference::InputVariable(String::from("base"))),
            )])),
        );
        child.add_output(OutputConfig {
            name: String::from("made"),
            value: Expr::reference(Reference::Resource(Resource::managed("test_thing", "inner")))
                .attr("id"),
            sensitive: false,
        });

        let mut root = Module::new();
        root.add_module_call(
            ModuleCall::new("net", child)
                .with_repetition(Repetition::Count(Expr::int(2)))
                .with_input("base", Expr::reference(Reference::CountIndex)),
        );
        root.add_output(OutputConfig {
            name: String::from("nets"),
            value: Expr::reference(Reference::ModuleCall(String::from("net"))),
            sensitive: false,
        });
        let config = Config::new(root);

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(plan.complete);
        assert_eq!(plan.changes.len(), 2);
        for (i, change) in plan.changes.iter().enumerate() {
            assert_eq!(change.action, Action::Create);
            assert_eq!(change.after.get_attr("base"), Some(Value::int(i as i64)));
        }

        let (state, diags) = engine
            .apply(&config, &plan, &State::new(), ApplyOpts::default())
            .await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert_eq!(state.all_instance_addrs().len(), 2);
        let nets = state.outputs().get("nets").unwrap();
        let list = nets.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|o| o.get_attr("made").is_some()));
    }

    #[tokio::test]
    async fn test_provider_requested_deferral() {
        let provider = Arc::new(
            MockProvider::new("test").with_deferred(DeferredReason::ResourceDeferredByProvider),
        );
        let engine = engine(&provider);
        let config = zoned_config("a", false);

        let (plan, diags) = engine.plan(&config, &State::new(), PlanOpts::default()).await;
        assert!(!diags.has_errors(), "{diags:?}");
        assert!(!plan.complete);
        assert_eq!(plan.deferred.len(), 1);
        assert_eq!(
            plan.deferred[0].reason,
            DeferredReason::ResourceDeferredByProvider
        );

        // The same round fails outright when deferral is not allowed.
        let (_, diags) = engine
            .plan(
                &config,
                &State::new(),
                PlanOpts {
                    deferrals_allowed: false,
                    ..PlanOpts::default()
                },
            )
            .await;
        assert!(diags.has_errors());
    }

    #[tokio::test]
    async fn test_validate_rejects_undeclared_reference() {
        let engine = Lattice::new();
        let mut root = Module::new();
        root.add_resource(ResourceConfig::managed("test_thing", "a").with_config(obj(&[(
            "v",
            Expr::reference(Reference::InputVariable(String::from("missing"))),
        )])));
        let diags = engine.validate(&Config::new(root));
        assert!(diags.has_errors());

        let diags = engine.validate(&counted_config());
        assert!(!diags.has_errors(), "{diags:?}");
    }
}
