//! The node visitor shared by plan and apply walks.
//!
//! Both walks traverse the same graph shape; the phase decides what a
//! resource instance visit does. Planning refreshes, evaluates the
//! desired configuration, consults the provider, and registers a
//! proposed change. Applying re-evaluates with apply-time values (so
//! unknowns from upstream objects resolve), then carries the planned
//! action out and writes the result into the working state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::addrs::{
    AbsResourceInstance, ConfigResource, InstanceKey, ModuleInstance, ModulePath,
    PartialExpandedResource, Reference, ResourceMode, Target,
};
use crate::config::{Condition, Repetition, ResourceConfig};
use crate::defer::{DeferralTracker, DeferredReason};
use crate::error::{Diagnostic, Diagnostics, LatticeError, ProviderError};
use crate::eval::{evaluate, EvalData, Scope};
use crate::expand::Expansion;
use crate::graph::{
    default_provider_for, removed_without_destroy, GraphNode, NodeVisitor, OrphanReason, Subgraph,
    VisitResult,
};
use crate::plan::{
    Action, ActionReason, CheckStatus, PlanMode, ResourceInstanceChange, SharedCheckResults,
};
use crate::provider::{
    ApplyResourceChangeRequest, ImportResourceStateRequest, PlanResourceChangeRequest, Provider,
    ReadDataSourceRequest, ReadResourceRequest,
};
use crate::state::{ObjectStatus, ResourceInstanceObject};
use crate::value::Value;

/// Which half of the plan/apply cycle a walk is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Plan,
    Apply,
}

/// Everything a node visit can reach, shared across one walk.
pub(crate) struct EngineContext {
    pub eval: EvalData,
    pub providers: BTreeMap<String, Arc<dyn Provider>>,
    pub provider_configs: Mutex<BTreeMap<String, Value>>,
    pub unknown_providers: Mutex<BTreeSet<String>>,
    pub tracker: DeferralTracker,
    pub checks: SharedCheckResults,
    pub drift: Mutex<Vec<ResourceInstanceChange>>,
    pub phase: Phase,
    pub mode: PlanMode,
    pub variables: BTreeMap<String, Value>,
    pub targets: Vec<Target>,
    pub force_replace: Vec<AbsResourceInstance>,
    /// Index of the plan being applied; empty during planning.
    pub plan_changes: BTreeMap<AbsResourceInstance, ResourceInstanceChange>,
    /// Remote object ids the root module's import blocks bind to
    /// instances, keyed by the instance address.
    pub imports: BTreeMap<AbsResourceInstance, String>,
}

pub(crate) struct EngineVisitor {
    ctx: Arc<EngineContext>,
}

#[async_trait]
impl NodeVisitor for EngineVisitor {
    async fn visit(&self, node: GraphNode) -> VisitResult {
        match node {
            GraphNode::Root => VisitResult::ok(),
            GraphNode::ModuleExpand { path } => self.visit_module_expand(&path).await,
            GraphNode::Variable { module, name } => self.visit_variable(&module, &name).await,
            GraphNode::Local { module, name } => self.visit_local(&module, &name).await,
            GraphNode::Output { module, name } => self.visit_output(&module, &name).await,
            GraphNode::Provider { name } => self.visit_provider(&name).await,
            GraphNode::ResourceExpand { addr } => self.visit_resource_expand(&addr).await,
            GraphNode::ResourceInstance { addr, refresh_only } => match self.ctx.phase {
                Phase::Plan => self.plan_instance(addr, refresh_only).await,
                Phase::Apply => self.apply_instance(addr).await,
            },
            GraphNode::OrphanInstance {
                addr,
                forget,
                reason,
            } => match self.ctx.phase {
                Phase::Plan => self.plan_orphan(addr, forget, reason).await,
                Phase::Apply => self.apply_instance(addr).await,
            },
            GraphNode::PartialExpanded { addr, config } => {
                self.visit_partial_expanded(addr, &config).await
            }
        }
    }
}

impl EngineVisitor {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Evaluates a repetition argument into an expansion, or class it
    /// unknown when the value is not yet decidable.
    async fn eval_repetition(
        &self,
        repetition: &Repetition,
        scope: &Scope,
        subject: &str,
    ) -> Result<Expansion, Diagnostics> {
        match repetition {
            Repetition::Single => Ok(Expansion::Single),
            Repetition::Count(expr) => {
                let value = evaluate(expr, scope, &self.ctx.eval).await?;
                if value.has_unknown() {
                    return Ok(Expansion::Unknown);
                }
                value
                    .as_count()
                    .map(Expansion::Count)
                    .ok_or_else(|| repetition_error("count", subject, &value))
            }
            Repetition::ForEach(expr) => {
                let value = evaluate(expr, scope, &self.ctx.eval).await?;
                if value.has_unknown() {
                    return Ok(Expansion::Unknown);
                }
                value
                    .as_map()
                    .cloned()
                    .map(Expansion::ForEach)
                    .ok_or_else(|| repetition_error("for_each", subject, &value))
            }
        }
    }

    async fn visit_module_expand(&self, path: &ModulePath) -> VisitResult {
        let ctx = &self.ctx;
        let (Some(parent_path), Some(call_name)) = (path.parent(), path.steps().last()) else {
            return VisitResult::ok();
        };
        let Some(call) = ctx
            .eval
            .config
            .module_at(&parent_path)
            .and_then(|m| m.module_calls.get(call_name))
        else {
            return VisitResult::ok();
        };

        let subject = format!("module.{call_name}");
        let subject = subject.as_str();
        let parents = ctx.eval.expander.expand_module(parent_path.steps());
        let results = join_all(parents.into_iter().map(|parent| {
            let repetition = &call.repetition;
            async move {
                let scope = Scope::in_module(parent.clone());
                let outcome = self.eval_repetition(repetition, &scope, subject).await;
                (parent, outcome)
            }
        }))
        .await;

        let mut diags = Diagnostics::new();
        for (parent, outcome) in results {
            match outcome {
                Ok(expansion) => {
                    ctx.eval
                        .expander
                        .set_module_expansion(&parent, call_name, expansion);
                }
                Err(errors) => diags.extend(errors),
            }
        }
        VisitResult::with_diagnostics(diags)
    }

    async fn visit_variable(&self, module: &ModulePath, name: &str) -> VisitResult {
        let ctx = &self.ctx;
        let Some(decl) = ctx
            .eval
            .config
            .module_at(module)
            .and_then(|m| m.variables.get(name))
        else {
            return VisitResult::ok();
        };

        let mut diags = Diagnostics::new();
        for instance in ctx.eval.expander.expand_module(module.steps()) {
            let value = if module.is_root() {
                ctx.variables
                    .get(name)
                    .cloned()
                    .or_else(|| decl.default.clone())
                    .unwrap_or_else(Value::null)
            } else {
                match self
                    .child_variable_value(&instance, name, decl.default.as_ref())
                    .await
                {
                    Ok(value) => value,
                    Err(errors) => {
                        diags.extend(errors);
                        continue;
                    }
                }
            };
            let value = if decl.sensitive {
                value.mark_sensitive()
            } else {
                value
            };
            ctx.eval.named.set_variable(instance, name, value);
        }
        VisitResult::with_diagnostics(diags)
    }

    /// A child module's variable value: the call's input expression
    /// evaluated in the parent scope, or the declared default.
    async fn child_variable_value(
        &self,
        instance: &ModuleInstance,
        name: &str,
        default: Option<&Value>,
    ) -> Result<Value, Diagnostics> {
        let ctx = &self.ctx;
        let (Some(parent), Some(step)) = (instance.parent(), instance.last_step()) else {
            return Ok(Value::null());
        };
        let Some(call) = ctx
            .eval
            .config
            .module_at(&parent.module_path())
            .and_then(|m| m.module_calls.get(&step.call))
        else {
            return Ok(Value::null());
        };
        match call.inputs.get(name) {
            Some(expr) => {
                let repetition = ctx
                    .eval
                    .expander
                    .module_repetition_data(&parent, &step.call, &step.key);
                let scope = Scope::in_module(parent).with_repetition(repetition);
                evaluate(expr, &scope, &ctx.eval).await
            }
            None => Ok(default.cloned().unwrap_or_else(Value::null)),
        }
    }

    async fn visit_local(&self, module: &ModulePath, name: &str) -> VisitResult {
        let ctx = &self.ctx;
        let Some(expr) = ctx
            .eval
            .config
            .module_at(module)
            .and_then(|m| m.locals.get(name))
        else {
            return VisitResult::ok();
        };
        let mut diags = Diagnostics::new();
        for instance in ctx.eval.expander.expand_module(module.steps()) {
            match evaluate(expr, &Scope::in_module(instance.clone()), &ctx.eval).await {
                Ok(value) => ctx.eval.named.set_local(instance, name, value),
                Err(errors) => diags.extend(errors),
            }
        }
        VisitResult::with_diagnostics(diags)
    }

    async fn visit_output(&self, module: &ModulePath, name: &str) -> VisitResult {
        let ctx = &self.ctx;
        let Some(decl) = ctx
            .eval
            .config
            .module_at(module)
            .and_then(|m| m.outputs.get(name))
        else {
            return VisitResult::ok();
        };
        let mut diags = Diagnostics::new();
        for instance in ctx.eval.expander.expand_module(module.steps()) {
            // Destroy rounds retract every output rather than evaluate
            // expressions over objects being destroyed.
            if ctx.mode == PlanMode::Destroy {
                ctx.eval.named.set_output(instance, name, Value::null());
                continue;
            }
            match evaluate(&decl.value, &Scope::in_module(instance.clone()), &ctx.eval).await {
                Ok(value) => {
                    let value = if decl.sensitive {
                        value.mark_sensitive()
                    } else {
                        value
                    };
                    ctx.eval.named.set_output(instance, name, value);
                }
                Err(errors) => diags.extend(errors),
            }
        }
        VisitResult::with_diagnostics(diags)
    }

    async fn visit_provider(&self, name: &str) -> VisitResult {
        let ctx = &self.ctx;
        let value = match ctx.eval.config.root.providers.get(name) {
            Some(pc) => match evaluate(&pc.config, &Scope::default(), &ctx.eval).await {
                Ok(value) => value,
                Err(errors) => return VisitResult::with_diagnostics(errors),
            },
            None => Value::null(),
        };
        if value.has_unknown() {
            debug!(provider = name, "provider configuration not fully known this round");
            lock(&ctx.unknown_providers).insert(name.to_string());
        }
        lock(&ctx.provider_configs).insert(name.to_string(), value);
        VisitResult::ok()
    }

    /// Resolves a resource's repetition for every module instance and
    /// expands into the per-instance nodes of this round.
    async fn visit_resource_expand(&self, addr: &ConfigResource) -> VisitResult {
        let ctx = &self.ctx;
        let Some(rc) = ctx.eval.config.resource(addr) else {
            return VisitResult::ok();
        };
        let mut diags = Diagnostics::new();

        let module_instances = ctx.eval.expander.expand_module(addr.module.steps());
        for instance in &module_instances {
            let abs = rc.resource.absolute(instance.clone());
            let scope = Scope::in_module(instance.clone());
            match self
                .eval_repetition(&rc.repetition, &scope, &addr.to_string())
                .await
            {
                Ok(expansion) => ctx.eval.expander.set_resource_expansion(&abs, expansion),
                Err(errors) => diags.extend(errors),
            }
        }
        if diags.has_errors() {
            return VisitResult::with_diagnostics(diags);
        }

        let (mut desired, partials) = ctx
            .eval
            .expander
            .expand_resource(addr.module.steps(), &rc.resource);

        // Targeting and forced replacement need concrete keys to match
        // against; an undecided expansion makes both ill-defined.
        if !partials.is_empty() {
            if !ctx.targets.is_empty() {
                diags.push(Diagnostic::error(
                    "Cannot target resource with undecided instances",
                    format!(
                        "The instance keys of {addr} are not yet decided, so targeting it is not possible this round."
                    ),
                ));
            }
            if ctx.force_replace.iter().any(|f| f.config_resource() == *addr) {
                diags.push(Diagnostic::error(
                    "Cannot force replacement",
                    format!(
                        "The instance keys of {addr} are not yet decided, so a replacement cannot be forced this round."
                    ),
                ));
            }
            if diags.has_errors() {
                return VisitResult::with_diagnostics(diags);
            }
        }

        if !ctx.targets.is_empty() {
            desired.retain(|instance| ctx.targets.iter().any(|t| t.matches_instance(instance)));
        }

        // A forced replacement naming a key shape the resource does not
        // have is almost always a typo; point at the real instances.
        if ctx.phase == Phase::Plan && partials.is_empty() {
            for forced in &ctx.force_replace {
                if forced.config_resource() != *addr || desired.contains(forced) {
                    continue;
                }
                let alternatives: Vec<String> = desired
                    .iter()
                    .map(|instance| format!("-replace=\"{instance}\""))
                    .collect();
                let hint = if alternatives.is_empty() {
                    String::from("this resource currently has no instances")
                } else {
                    format!("did you mean {}?", alternatives.join(" or "))
                };
                warn!(addr = %forced, "replacement request matches no current instance");
                diags.push(Diagnostic::warning(
                    "Incompletely-matched replacement request",
                    format!("{forced} matches no current instance of {addr}; {hint}"),
                ));
            }
        }

        let priors: Vec<AbsResourceInstance> = ctx
            .eval
            .state
            .read(|state| state.instances_of(addr).into_iter().map(|(a, _)| a).collect())
            .await;

        let mut nodes: Vec<GraphNode> = Vec::new();

        if ctx.mode == PlanMode::Destroy {
            // Destroy rounds desire nothing; everything recorded goes.
            for prior in priors {
                nodes.push(GraphNode::OrphanInstance {
                    addr: prior,
                    forget: false,
                    reason: OrphanReason::NoResourceConfig,
                });
            }
        } else {
            for prior in priors {
                if desired.contains(&prior) {
                    continue;
                }
                if partials.iter().any(|p| p.matches_instance(&prior)) {
                    // Maybe-orphan: membership undecidable this round,
                    // so refresh it but plan no action.
                    nodes.push(GraphNode::ResourceInstance {
                        addr: prior,
                        refresh_only: true,
                    });
                    continue;
                }
                if !ctx.targets.is_empty()
                    && !ctx.targets.iter().any(|t| t.matches_instance(&prior))
                {
                    continue;
                }
                let module_live = module_instances.contains(&prior.resource.module);
                nodes.push(GraphNode::OrphanInstance {
                    forget: removed_without_destroy(&ctx.eval.config, addr),
                    reason: if module_live {
                        OrphanReason::WrongRepetition
                    } else {
                        OrphanReason::NoModule
                    },
                    addr: prior,
                });
            }

            let has_conditions = !rc.preconditions.is_empty() || !rc.postconditions.is_empty();
            for instance in desired {
                if ctx.phase == Phase::Plan && has_conditions {
                    ctx.checks
                        .register_expected_object(&addr.to_string(), &instance.to_string());
                }
                nodes.push(GraphNode::ResourceInstance {
                    addr: instance,
                    refresh_only: false,
                });
            }
            for partial in partials {
                nodes.push(GraphNode::PartialExpanded {
                    addr: partial,
                    config: addr.clone(),
                });
            }
        }

        VisitResult {
            diagnostics: diags,
            expansion: Some(Subgraph {
                nodes,
                edges: Vec::new(),
            }),
        }
    }

    async fn plan_instance(&self, addr: AbsResourceInstance, refresh_only: bool) -> VisitResult {
        let ctx = &self.ctx;
        let config_addr = addr.config_resource();
        let Some(rc) = ctx.eval.config.resource(&config_addr) else {
            return VisitResult::ok();
        };
        let mut diags = Diagnostics::new();

        // Anything downstream of a deferred dependency must defer too,
        // or it would plan against placeholder data.
        let deps = declared_dependencies(rc, &config_addr.module);
        if ctx.tracker.should_defer(&deps) {
            self.defer_instance(&addr, rc, DeferredReason::DeferredPrereq).await;
            return VisitResult::ok();
        }
        if lock(&ctx.unknown_providers).contains(&rc.provider) {
            if ctx.tracker.deferrals_allowed() {
                self.defer_instance(&addr, rc, DeferredReason::ProviderConfigUnknown)
                    .await;
                return VisitResult::ok();
            }
            diags.push_error(&LatticeError::Provider(ProviderError::DeferralNotAllowed {
                provider: rc.provider.clone(),
                instance: addr,
            }));
            return VisitResult::with_diagnostics(diags);
        }

        let provider = match self.provider_for(&rc.provider, &config_addr) {
            Ok(provider) => provider,
            Err(err) => {
                diags.push_error(&err);
                return VisitResult::with_diagnostics(diags);
            }
        };
        let provider_config = self.provider_config(&rc.provider);

        let mut prior = ctx.eval.state.read(|s| s.instance(&addr).cloned()).await;
        let mut importing: Option<String> = None;

        // An import block binds an existing remote object to this
        // instance; read it and treat it as the prior going forward.
        if rc.resource.mode == ResourceMode::Managed && prior.is_none() {
            if let Some(id) = ctx.imports.get(&addr).cloned() {
                let response = provider
                    .import_resource_state(ImportResourceStateRequest {
                        type_name: rc.resource.r#type.clone(),
                        id: id.clone(),
                        provider_config: provider_config.clone(),
                    })
                    .await;
                match response {
                    Ok(resp) => {
                        if let Some(reason) = resp.deferred {
                            if !ctx.tracker.deferrals_allowed() {
                                diags.push_error(&LatticeError::Provider(
                                    ProviderError::DeferralNotAllowed {
                                        provider: rc.provider.clone(),
                                        instance: addr,
                                    },
                                ));
                                return VisitResult::with_diagnostics(diags);
                            }
                            self.defer_instance(&addr, rc, reason).await;
                            return VisitResult::ok();
                        }
                        info!(addr = %addr, id, "found existing object to import");
                        let object = ResourceInstanceObject {
                            value: resp.value,
                            status: ObjectStatus::Ready,
                            create_before_destroy: rc.lifecycle.create_before_destroy,
                            dependencies: deps.clone(),
                            private: resp.private,
                        };
                        ctx.eval
                            .state
                            .write(|s| s.set_instance(addr.clone(), object.clone()))
                            .await;
                        prior = Some(object);
                        importing = Some(id);
                    }
                    Err(err) => {
                        diags.push_error(&err);
                        return VisitResult::with_diagnostics(diags);
                    }
                }
            }
        }

        // Refresh managed objects so the plan diffs against reality.
        if rc.resource.mode == ResourceMode::Managed && importing.is_none() {
            if let Some(object) = prior.clone() {
                let response = provider
                    .read_resource(ReadResourceRequest {
                        addr: addr.clone(),
                        prior: object.value.clone(),
                        private: object.private.clone(),
                        provider_config: provider_config.clone(),
                    })
                    .await;
                match response {
                    Ok(resp) => {
                        if let Some(reason) = resp.deferred {
                            if !ctx.tracker.deferrals_allowed() {
                                diags.push_error(&LatticeError::Provider(
                                    ProviderError::DeferralNotAllowed {
                                        provider: rc.provider.clone(),
                                        instance: addr,
                                    },
                                ));
                                return VisitResult::with_diagnostics(diags);
                            }
                            self.defer_instance(&addr, rc, reason).await;
                            return VisitResult::ok();
                        }
                        prior = self
                            .record_refresh(&addr, &rc.provider, object, resp.value, resp.private)
                            .await;
                    }
                    Err(err) => {
                        diags.push_error(&err);
                        return VisitResult::with_diagnostics(diags);
                    }
                }
            }
        }

        if refresh_only || ctx.mode == PlanMode::RefreshOnly {
            return VisitResult::with_diagnostics(diags);
        }

        if rc.resource.mode == ResourceMode::Data {
            return self
                .plan_data_source(addr, rc, provider.as_ref(), provider_config, diags)
                .await;
        }

        let repetition = ctx
            .eval
            .expander
            .resource_repetition_data(&addr.resource, &addr.key);
        let scope = Scope::in_module(addr.resource.module.clone()).with_repetition(repetition);
        let proposed = match evaluate(&rc.config, &scope, &ctx.eval).await {
            Ok(value) => value,
            Err(errors) => {
                diags.extend(errors);
                return VisitResult::with_diagnostics(diags);
            }
        };

        if !self
            .check_conditions(&rc.preconditions, &scope, &config_addr, &addr, "precondition", &mut diags)
            .await
        {
            return VisitResult::with_diagnostics(diags);
        }

        let resp = match provider
            .plan_resource_change(PlanResourceChangeRequest {
                addr: addr.clone(),
                prior: prior.as_ref().map(|o| o.value.clone()),
                proposed,
                provider_config,
            })
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                diags.push_error(&err);
                return VisitResult::with_diagnostics(diags);
            }
        };
        if let Some(reason) = resp.deferred {
            if ctx.tracker.deferrals_allowed() {
                self.defer_instance(&addr, rc, reason).await;
                return VisitResult::with_diagnostics(diags);
            }
            diags.push_error(&LatticeError::Provider(ProviderError::DeferralNotAllowed {
                provider: rc.provider.clone(),
                instance: addr,
            }));
            return VisitResult::with_diagnostics(diags);
        }

        let forced = ctx.force_replace.contains(&addr);
        let tainted = prior
            .as_ref()
            .is_some_and(|o| o.status == ObjectStatus::Tainted);
        let before = prior
            .as_ref()
            .map_or_else(Value::null, |o| o.value.clone());
        let create_before = rc.lifecycle.create_before_destroy
            || prior
                .as_ref()
                .is_some_and(ResourceInstanceObject::is_create_before_destroy);

        let (action, reason) = if prior.is_none() {
            (Action::Create, None)
        } else if !resp.requires_replace.is_empty() {
            (
                replace_action(create_before),
                Some(ActionReason::ReplaceBecauseCannotUpdate),
            )
        } else if tainted {
            (
                replace_action(create_before),
                Some(ActionReason::ReplaceBecauseTainted),
            )
        } else if forced {
            (
                replace_action(create_before),
                Some(ActionReason::ReplaceByRequest),
            )
        } else if before == resp.planned {
            (Action::NoOp, None)
        } else {
            (Action::Update, None)
        };

        info!(addr = %addr, %action, "planned resource instance change");
        let mut change = ResourceInstanceChange::new(
            addr.clone(),
            rc.provider.clone(),
            action,
            before,
            resp.planned,
        )
        .with_required_replace(resp.requires_replace);
        if let Some(reason) = reason {
            change = change.with_reason(reason);
        }
        if let Some(id) = importing {
            change = change.with_importing(id);
        }
        ctx.eval.changes.register(change);

        // Postconditions see the planned new value through the change
        // registry; anything not yet knowable reports as unknown.
        self.check_conditions(&rc.postconditions, &scope, &config_addr, &addr, "postcondition", &mut diags)
            .await;
        VisitResult::with_diagnostics(diags)
    }

    async fn plan_data_source(
        &self,
        addr: AbsResourceInstance,
        rc: &ResourceConfig,
        provider: &dyn Provider,
        provider_config: Value,
        mut diags: Diagnostics,
    ) -> VisitResult {
        let ctx = &self.ctx;
        let config_addr = addr.config_resource();
        let repetition = ctx
            .eval
            .expander
            .resource_repetition_data(&addr.resource, &addr.key);
        let scope = Scope::in_module(addr.resource.module.clone()).with_repetition(repetition);
        let config_value = match evaluate(&rc.config, &scope, &ctx.eval).await {
            Ok(value) => value,
            Err(errors) => {
                diags.extend(errors);
                return VisitResult::with_diagnostics(diags);
            }
        };
        if !self
            .check_conditions(&rc.preconditions, &scope, &config_addr, &addr, "precondition", &mut diags)
            .await
        {
            return VisitResult::with_diagnostics(diags);
        }

        // A read whose configuration is not fully known waits for apply.
        if config_value.has_unknown() {
            ctx.eval.changes.register(ResourceInstanceChange::new(
                addr,
                rc.provider.clone(),
                Action::Read,
                Value::null(),
                Value::unknown(),
            ));
            return VisitResult::with_diagnostics(diags);
        }

        match provider
            .read_data_source(ReadDataSourceRequest {
                addr: addr.clone(),
                config: config_value,
                provider_config,
            })
            .await
        {
            Ok(resp) => {
                if let Some(reason) = resp.deferred {
                    if ctx.tracker.deferrals_allowed() {
                        self.defer_instance(&addr, rc, reason).await;
                        return VisitResult::with_diagnostics(diags);
                    }
                    diags.push_error(&LatticeError::Provider(ProviderError::DeferralNotAllowed {
                        provider: rc.provider.clone(),
                        instance: addr,
                    }));
                    return VisitResult::with_diagnostics(diags);
                }
                let value = resp.value;
                ctx.eval
                    .state
                    .write(|s| {
                        s.set_instance(addr.clone(), ResourceInstanceObject::ready(value.clone()));
                    })
                    .await;
                ctx.eval.changes.register(ResourceInstanceChange::new(
                    addr,
                    rc.provider.clone(),
                    Action::NoOp,
                    value.clone(),
                    value,
                ));
                VisitResult::with_diagnostics(diags)
            }
            Err(err) => {
                diags.push_error(&err);
                VisitResult::with_diagnostics(diags)
            }
        }
    }

    async fn plan_orphan(
        &self,
        addr: AbsResourceInstance,
        forget: bool,
        reason: OrphanReason,
    ) -> VisitResult {
        let ctx = &self.ctx;
        let mut diags = Diagnostics::new();
        let Some(object) = ctx.eval.state.read(|s| s.instance(&addr).cloned()).await else {
            return VisitResult::ok();
        };
        let provider_name = orphan_provider_name(ctx, &addr);

        if forget {
            warn!(addr = %addr, "object will be forgotten, not destroyed");
            diags.push(Diagnostic::warning(
                "Object will be forgotten",
                format!(
                    "{addr} will be removed from state, but the remote object it tracks will not be destroyed."
                ),
            ));
            ctx.eval.changes.register(
                ResourceInstanceChange::new(
                    addr,
                    provider_name,
                    Action::Forget,
                    object.value,
                    Value::null(),
                )
                .with_reason(ActionReason::ForgetBecauseRemoved),
            );
            return VisitResult::with_diagnostics(diags);
        }

        // Refresh first; an object already gone upstream needs no plan.
        let mut value = object.value.clone();
        if addr.resource.resource.mode == ResourceMode::Managed {
            let provider = match self.provider_for(&provider_name, &addr.config_resource()) {
                Ok(provider) => provider,
                Err(err) => {
                    diags.push_error(&err);
                    return VisitResult::with_diagnostics(diags);
                }
            };
            let response = provider
                .read_resource(ReadResourceRequest {
                    addr: addr.clone(),
                    prior: object.value.clone(),
                    private: object.private.clone(),
                    provider_config: self.provider_config(&provider_name),
                })
                .await;
            match response {
                Ok(resp) => {
                    if resp.deferred.is_none() {
                        match self
                            .record_refresh(&addr, &provider_name, object, resp.value, resp.private)
                            .await
                        {
                            Some(updated) => value = updated.value,
                            None => return VisitResult::with_diagnostics(diags),
                        }
                    }
                }
                Err(err) => {
                    diags.push_error(&err);
                    return VisitResult::with_diagnostics(diags);
                }
            }
        }

        if ctx.mode == PlanMode::RefreshOnly {
            return VisitResult::with_diagnostics(diags);
        }

        info!(addr = %addr, "planned destroy of orphaned instance");
        let mut change = ResourceInstanceChange::new(
            addr,
            provider_name,
            Action::Delete,
            value,
            Value::null(),
        );
        if ctx.mode != PlanMode::Destroy {
            change = change.with_reason(orphan_reason(reason));
        }
        ctx.eval.changes.register(change);
        VisitResult::with_diagnostics(diags)
    }

    async fn visit_partial_expanded(
        &self,
        partial: PartialExpandedResource,
        config: &ConfigResource,
    ) -> VisitResult {
        let ctx = &self.ctx;
        if ctx.phase == Phase::Apply {
            return VisitResult::ok();
        }
        let provider_name = ctx
            .eval
            .config
            .resource(config)
            .map_or_else(
                || default_provider_for(&config.resource.r#type).to_string(),
                |rc| rc.provider.clone(),
            );
        let representative = representative_addr(&partial);

        if !ctx.tracker.deferrals_allowed() {
            return VisitResult::with_diagnostics(
                LatticeError::Provider(ProviderError::DeferralNotAllowed {
                    provider: provider_name,
                    instance: representative,
                })
                .into(),
            );
        }

        let has_priors = ctx
            .eval
            .state
            .read(|s| {
                s.all_instance_addrs()
                    .iter()
                    .any(|a| partial.matches_instance(a))
            })
            .await;
        let action = if has_priors {
            Action::Update
        } else {
            Action::Create
        };
        let change = ResourceInstanceChange::new(
            representative,
            provider_name,
            action,
            Value::null(),
            Value::unknown(),
        );
        ctx.tracker.report_partial_expanded_deferred(
            partial,
            change,
            DeferredReason::InstanceCountUnknown,
        );
        VisitResult::ok()
    }

    /// Carries out the planned action for one instance during apply.
    async fn apply_instance(&self, addr: AbsResourceInstance) -> VisitResult {
        let ctx = &self.ctx;
        let Some(change) = ctx.plan_changes.get(&addr).cloned() else {
            // Nothing planned here; re-register the current value so
            // dependent expressions still resolve.
            let value = ctx
                .eval
                .state
                .read(|s| s.instance(&addr).map(|o| o.value.clone()))
                .await;
            if let Some(value) = value {
                let provider = orphan_provider_name(ctx, &addr);
                ctx.eval.changes.register(ResourceInstanceChange::new(
                    addr,
                    provider,
                    Action::NoOp,
                    value.clone(),
                    value,
                ));
            }
            return VisitResult::ok();
        };

        // An importing change adopts the remote object into state first;
        // the planned action then proceeds against that prior.
        if let Some(id) = change.importing.clone() {
            if let Some(failed) = self.apply_import(&addr, &id).await {
                return failed;
            }
        }

        match change.action {
            Action::NoOp => {
                ctx.eval.changes.register(change);
                VisitResult::ok()
            }
            Action::Forget => {
                info!(addr = %addr, "removing instance from state without destroying");
                ctx.eval
                    .state
                    .write(|s| {
                        s.remove_instance(&addr);
                    })
                    .await;
                ctx.eval.changes.register(change);
                VisitResult::ok()
            }
            Action::Read => self.apply_data_read(addr, change).await,
            Action::Delete => self.apply_destroy(addr, change).await,
            Action::Create | Action::Update => self.apply_create_update(addr, change).await,
            Action::DeleteThenCreate => {
                let destroy = self.apply_destroy(addr.clone(), change.clone()).await;
                if destroy.diagnostics.has_errors() {
                    return destroy;
                }
                let mut diags = destroy.diagnostics;
                let create = self.apply_create_update(addr, change).await;
                diags.extend(create.diagnostics);
                VisitResult::with_diagnostics(diags)
            }
            Action::CreateThenDelete => self.apply_create_then_delete(addr, change).await,
        }
    }

    /// Reads the remote object an import binds to `addr` and records it
    /// in state. Returns a failed result if the provider call errored.
    async fn apply_import(&self, addr: &AbsResourceInstance, id: &str) -> Option<VisitResult> {
        let ctx = &self.ctx;
        let present = ctx.eval.state.read(|s| s.instance(addr).is_some()).await;
        if present {
            return None;
        }
        let config_addr = addr.config_resource();
        let rc = ctx.eval.config.resource(&config_addr)?;
        let provider = match self.provider_for(&rc.provider, &config_addr) {
            Ok(provider) => provider,
            Err(err) => {
                let mut diags = Diagnostics::new();
                diags.push_error(&err);
                return Some(VisitResult::with_diagnostics(diags));
            }
        };
        let response = provider
            .import_resource_state(ImportResourceStateRequest {
                type_name: rc.resource.r#type.clone(),
                id: id.to_string(),
                provider_config: self.provider_config(&rc.provider),
            })
            .await;
        match response {
            Ok(resp) => {
                if resp.deferred.is_some() {
                    let mut diags = Diagnostics::new();
                    diags.push_error(&LatticeError::Provider(
                        ProviderError::DeferralNotAllowed {
                            provider: rc.provider.clone(),
                            instance: addr.clone(),
                        },
                    ));
                    return Some(VisitResult::with_diagnostics(diags));
                }
                info!(addr = %addr, id, "imported existing object into state");
                let object = ResourceInstanceObject {
                    value: resp.value,
                    status: ObjectStatus::Ready,
                    create_before_destroy: rc.lifecycle.create_before_destroy,
                    dependencies: declared_dependencies(rc, &config_addr.module),
                    private: resp.private,
                };
                ctx.eval
                    .state
                    .write(|s| s.set_instance(addr.clone(), object))
                    .await;
                None
            }
            Err(err) => {
                let mut diags = Diagnostics::new();
                diags.push_error(&err);
                Some(VisitResult::with_diagnostics(diags))
            }
        }
    }

    async fn apply_create_update(
        &self,
        addr: AbsResourceInstance,
        change: ResourceInstanceChange,
    ) -> VisitResult {
        let ctx = &self.ctx;
        let mut diags = Diagnostics::new();
        let config_addr = addr.config_resource();
        let Some(rc) = ctx.eval.config.resource(&config_addr) else {
            return VisitResult::ok();
        };
        let provider = match self.provider_for(&rc.provider, &config_addr) {
            Ok(provider) => provider,
            Err(err) => {
                diags.push_error(&err);
                return VisitResult::with_diagnostics(diags);
            }
        };
        let provider_config = self.provider_config(&rc.provider);

        let repetition = ctx
            .eval
            .expander
            .resource_repetition_data(&addr.resource, &addr.key);
        let scope = Scope::in_module(addr.resource.module.clone()).with_repetition(repetition);
        let proposed = match evaluate(&rc.config, &scope, &ctx.eval).await {
            Ok(value) => value,
            Err(errors) => {
                diags.extend(errors);
                return VisitResult::with_diagnostics(diags);
            }
        };

        let prior = ctx.eval.state.read(|s| s.instance(&addr).cloned()).await;

        // Re-plan with apply-time values: upstream objects now exist, so
        // unknowns from the planning round resolve here.
        let plan_resp = match provider
            .plan_resource_change(PlanResourceChangeRequest {
                addr: addr.clone(),
                prior: prior.as_ref().map(|o| o.value.clone()),
                proposed,
                provider_config: provider_config.clone(),
            })
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                diags.push_error(&err);
                return VisitResult::with_diagnostics(diags);
            }
        };

        let response = provider
            .apply_resource_change(ApplyResourceChangeRequest {
                addr: addr.clone(),
                prior: prior.as_ref().map(|o| o.value.clone()),
                planned: Some(plan_resp.planned),
                private: plan_resp.private,
                provider_config,
            })
            .await;
        match response {
            Ok(resp) => {
                let Some(value) = resp.value else {
                    diags.push(Diagnostic::error(
                        "Provider returned no object",
                        format!(
                            "The provider reported success applying {addr} but returned no object."
                        ),
                    ));
                    return VisitResult::with_diagnostics(diags);
                };
                let object = ResourceInstanceObject {
                    value: value.clone(),
                    status: ObjectStatus::Ready,
                    create_before_destroy: rc.lifecycle.create_before_destroy,
                    dependencies: declared_dependencies(rc, &config_addr.module),
                    private: resp.private,
                };
                ctx.eval
                    .state
                    .write(|s| s.set_instance(addr.clone(), object))
                    .await;
                info!(addr = %addr, action = %change.action, "applied resource change");

                let mut applied = change;
                applied.after = value;
                ctx.eval.changes.register(applied);

                self.check_conditions(
                    &rc.postconditions,
                    &scope,
                    &config_addr,
                    &addr,
                    "postcondition",
                    &mut diags,
                )
                .await;
                VisitResult::with_diagnostics(diags)
            }
            Err(err) => {
                // A failed update leaves the remote object suspect; a
                // tainted record forces replacement next round.
                if prior.is_some() {
                    ctx.eval.state.write(|s| s.taint_instance(&addr)).await;
                }
                diags.push_error(&err);
                VisitResult::with_diagnostics(diags)
            }
        }
    }

    async fn apply_destroy(
        &self,
        addr: AbsResourceInstance,
        change: ResourceInstanceChange,
    ) -> VisitResult {
        let ctx = &self.ctx;
        let mut diags = Diagnostics::new();
        let Some(object) = ctx.eval.state.read(|s| s.instance(&addr).cloned()).await else {
            if change.action == Action::Delete {
                ctx.eval.changes.register(change);
            }
            return VisitResult::ok();
        };

        // Data reads have nothing remote to destroy.
        if addr.resource.resource.mode == ResourceMode::Data {
            ctx.eval
                .state
                .write(|s| {
                    s.remove_instance(&addr);
                })
                .await;
            if change.action == Action::Delete {
                ctx.eval.changes.register(change);
            }
            return VisitResult::ok();
        }

        let provider_name = change.provider.clone();
        let provider = match self.provider_for(&provider_name, &addr.config_resource()) {
            Ok(provider) => provider,
            Err(err) => {
                diags.push_error(&err);
                return VisitResult::with_diagnostics(diags);
            }
        };
        let response = provider
            .apply_resource_change(ApplyResourceChangeRequest {
                addr: addr.clone(),
                prior: Some(object.value),
                planned: None,
                private: object.private,
                provider_config: self.provider_config(&provider_name),
            })
            .await;
        match response {
            Ok(_) => {
                info!(addr = %addr, "destroyed instance");
                ctx.eval
                    .state
                    .write(|s| {
                        s.remove_instance(&addr);
                    })
                    .await;
                if change.action == Action::Delete {
                    ctx.eval.changes.register(change);
                }
                VisitResult::ok()
            }
            Err(err) => {
                diags.push_error(&err);
                VisitResult::with_diagnostics(diags)
            }
        }
    }

    async fn apply_create_then_delete(
        &self,
        addr: AbsResourceInstance,
        change: ResourceInstanceChange,
    ) -> VisitResult {
        let ctx = &self.ctx;
        // Move the old object aside so the create does not clobber it.
        let deposed = ctx.eval.state.write(|s| s.depose_instance(&addr)).await;
        let mut result = self.apply_create_update(addr.clone(), change).await;
        if result.diagnostics.has_errors() {
            return result;
        }
        let Some(key) = deposed else {
            return result;
        };
        let Some(object) = ctx
            .eval
            .state
            .read(|s| s.deposed_instance(&addr, &key).cloned())
            .await
        else {
            return result;
        };

        let provider_name = orphan_provider_name(ctx, &addr);
        match self.provider_for(&provider_name, &addr.config_resource()) {
            Ok(provider) => {
                let response = provider
                    .apply_resource_change(ApplyResourceChangeRequest {
                        addr: addr.clone(),
                        prior: Some(object.value),
                        planned: None,
                        private: object.private,
                        provider_config: self.provider_config(&provider_name),
                    })
                    .await;
                match response {
                    Ok(_) => {
                        info!(addr = %addr, deposed = %key, "destroyed deposed object");
                        ctx.eval
                            .state
                            .write(|s| {
                                s.remove_deposed(&addr, &key);
                            })
                            .await;
                    }
                    // The deposed record stays for a later round.
                    Err(err) => result.diagnostics.push_error(&err),
                }
            }
            Err(err) => result.diagnostics.push_error(&err),
        }
        result
    }

    async fn apply_data_read(
        &self,
        addr: AbsResourceInstance,
        change: ResourceInstanceChange,
    ) -> VisitResult {
        let ctx = &self.ctx;
        let mut diags = Diagnostics::new();
        let config_addr = addr.config_resource();
        let Some(rc) = ctx.eval.config.resource(&config_addr) else {
            return VisitResult::ok();
        };
        let provider = match self.provider_for(&rc.provider, &config_addr) {
            Ok(provider) => provider,
            Err(err) => {
                diags.push_error(&err);
                return VisitResult::with_diagnostics(diags);
            }
        };
        let repetition = ctx
            .eval
            .expander
            .resource_repetition_data(&addr.resource, &addr.key);
        let scope = Scope::in_module(addr.resource.module.clone()).with_repetition(repetition);
        let config_value = match evaluate(&rc.config, &scope, &ctx.eval).await {
            Ok(value) => value,
            Err(errors) => {
                diags.extend(errors);
                return VisitResult::with_diagnostics(diags);
            }
        };
        let response = provider
            .read_data_source(ReadDataSourceRequest {
                addr: addr.clone(),
                config: config_value,
                provider_config: self.provider_config(&rc.provider),
            })
            .await;
        match response {
            Ok(resp) => {
                let value = resp.value;
                ctx.eval
                    .state
                    .write(|s| {
                        s.set_instance(addr.clone(), ResourceInstanceObject::ready(value.clone()));
                    })
                    .await;
                let mut applied = change;
                applied.after = value;
                ctx.eval.changes.register(applied);
                VisitResult::with_diagnostics(diags)
            }
            Err(err) => {
                diags.push_error(&err);
                VisitResult::with_diagnostics(diags)
            }
        }
    }

    /// Records a deferral for one concrete instance.
    async fn defer_instance(
        &self,
        addr: &AbsResourceInstance,
        rc: &ResourceConfig,
        reason: DeferredReason,
    ) {
        let ctx = &self.ctx;
        let before = ctx
            .eval
            .state
            .read(|s| s.instance(addr).map(|o| o.value.clone()))
            .await;
        let action = if before.is_some() {
            Action::Update
        } else {
            Action::Create
        };
        let change = ResourceInstanceChange::new(
            addr.clone(),
            rc.provider.clone(),
            action,
            before.unwrap_or_else(Value::null),
            Value::unknown(),
        );
        ctx.tracker.report_instance_deferred(change, reason);
    }

    /// Applies a refresh result to the working state, recording drift.
    /// Returns the object as it now stands, or `None` if it is gone
    /// upstream.
    async fn record_refresh(
        &self,
        addr: &AbsResourceInstance,
        provider: &str,
        object: ResourceInstanceObject,
        refreshed: Option<Value>,
        private: Vec<u8>,
    ) -> Option<ResourceInstanceObject> {
        let ctx = &self.ctx;
        match refreshed {
            None => {
                info!(addr = %addr, "object no longer exists upstream");
                lock(&ctx.drift).push(ResourceInstanceChange::new(
                    addr.clone(),
                    provider,
                    Action::Delete,
                    object.value,
                    Value::null(),
                ));
                ctx.eval
                    .state
                    .write(|s| {
                        s.remove_instance(addr);
                    })
                    .await;
                None
            }
            Some(value) if value != object.value => {
                debug!(addr = %addr, "refresh found drift");
                lock(&ctx.drift).push(ResourceInstanceChange::new(
                    addr.clone(),
                    provider,
                    Action::Update,
                    object.value.clone(),
                    value.clone(),
                ));
                let updated = ResourceInstanceObject {
                    value,
                    private,
                    ..object
                };
                ctx.eval
                    .state
                    .write(|s| s.set_instance(addr.clone(), updated.clone()))
                    .await;
                Some(updated)
            }
            Some(_) => Some(ResourceInstanceObject { private, ..object }),
        }
    }

    /// Evaluates custom conditions, reporting each into the check
    /// results. Returns false when a failure or error should stop
    /// further work on this instance.
    async fn check_conditions(
        &self,
        conditions: &[Condition],
        scope: &Scope,
        config_addr: &ConfigResource,
        addr: &AbsResourceInstance,
        kind: &str,
        diags: &mut Diagnostics,
    ) -> bool {
        let ctx = &self.ctx;
        let mut ok = true;
        for condition in conditions {
            let (status, failure) = match evaluate(&condition.condition, scope, &ctx.eval).await {
                Ok(value) if value.has_unknown() => (CheckStatus::Unknown, None),
                Ok(value) => match value.as_bool() {
                    Some(true) => (CheckStatus::Pass, None),
                    _ => {
                        ok = false;
                        diags.push(
                            Diagnostic::error(
                                format!("Resource {kind} failed"),
                                condition.error_message.clone(),
                            )
                            .with_address(addr),
                        );
                        (CheckStatus::Fail, Some(condition.error_message.clone()))
                    }
                },
                Err(errors) => {
                    ok = false;
                    diags.extend(errors);
                    (CheckStatus::Error, None)
                }
            };
            ctx.checks
                .report(&config_addr.to_string(), &addr.to_string(), status, failure);
        }
        ok
    }

    fn provider_for(
        &self,
        name: &str,
        resource: &ConfigResource,
    ) -> crate::error::Result<Arc<dyn Provider>> {
        self.ctx.providers.get(name).cloned().ok_or_else(|| {
            LatticeError::Provider(ProviderError::NoProvider {
                resource: resource.clone(),
            })
        })
    }

    fn provider_config(&self, name: &str) -> Value {
        lock(&self.ctx.provider_configs)
            .get(name)
            .cloned()
            .unwrap_or_else(Value::null)
    }
}

/// The provider responsible for an instance whose configuration block
/// may be gone: the declared one if the block survives, otherwise the
/// name implied by the resource type.
fn orphan_provider_name(ctx: &EngineContext, addr: &AbsResourceInstance) -> String {
    ctx.eval.config.resource(&addr.config_resource()).map_or_else(
        || default_provider_for(&addr.resource.resource.r#type).to_string(),
        |rc| rc.provider.clone(),
    )
}

/// The configuration-level resources an instance's plan depends on:
/// referenced resources plus explicit depends_on, within its module.
fn declared_dependencies(rc: &ResourceConfig, module: &ModulePath) -> Vec<ConfigResource> {
    let mut deps: Vec<ConfigResource> = rc
        .references()
        .iter()
        .filter_map(Reference::resource)
        .map(|r| r.in_module(module.clone()))
        .collect();
    deps.sort();
    deps.dedup();
    deps
}

/// The wildcard-keyed address standing in for every instance a partial
/// prefix could produce.
fn representative_addr(partial: &PartialExpandedResource) -> AbsResourceInstance {
    let mut module = partial.module.known_prefix.clone();
    for call in &partial.module.unexpanded_calls {
        module = module.child(call.clone(), InstanceKey::Wildcard);
    }
    partial
        .resource
        .absolute(module)
        .instance(InstanceKey::Wildcard)
}

const fn replace_action(create_before_destroy: bool) -> Action {
    if create_before_destroy {
        Action::CreateThenDelete
    } else {
        Action::DeleteThenCreate
    }
}

const fn orphan_reason(reason: OrphanReason) -> ActionReason {
    match reason {
        OrphanReason::NoResourceConfig => ActionReason::DeleteBecauseNoResourceConfig,
        OrphanReason::NoModule => ActionReason::DeleteBecauseNoModule,
        OrphanReason::WrongRepetition => ActionReason::DeleteBecauseWrongRepetition,
    }
}

fn repetition_error(argument: &'static str, subject: &str, value: &Value) -> Diagnostics {
    let message = if value.is_null() {
        format!("the {argument} argument is null")
    } else if argument == "count" {
        String::from("the count argument must be a non-negative whole number")
    } else {
        String::from("the for_each argument must be a map with string keys")
    };
    LatticeError::Config(crate::error::ConfigError::InvalidRepetition {
        argument,
        resource: subject.to_string(),
        message,
    })
    .into()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
