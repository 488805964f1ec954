use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;
use split_core::{Callout, ClassifyEvent, Decision, ObjectKey, RedirectTarget};

use crate::{
    CalloutRegistration, Filter, FilterAction, HostEngine, HostError, Provider, Sublayer,
};

#[derive(Clone)]
struct RegisteredCallout {
    registration: CalloutRegistration,
    function: Arc<dyn Callout>,
}

impl fmt::Debug for RegisteredCallout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCallout")
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
struct Objects {
    providers: BTreeMap<ObjectKey, Provider>,
    sublayers: BTreeMap<ObjectKey, Sublayer>,
    callouts: BTreeMap<ObjectKey, RegisteredCallout>,
    filters: BTreeMap<ObjectKey, Filter>,
}

impl Objects {
    fn provider_user(&self, provider: ObjectKey) -> Option<ObjectKey> {
        let sublayers = self
            .sublayers
            .values()
            .filter(|sublayer| sublayer.provider == Some(provider))
            .map(|sublayer| sublayer.key);
        let callouts = self
            .callouts
            .values()
            .filter(|callout| callout.registration.provider == provider)
            .map(|callout| callout.registration.key);
        let filters = self
            .filters
            .values()
            .filter(|filter| filter.provider == Some(provider))
            .map(|filter| filter.key);
        sublayers.chain(callouts).chain(filters).next()
    }

    fn check_provider(&self, key: ObjectKey, provider: Option<ObjectKey>) -> Result<(), HostError> {
        match provider {
            Some(provider) if !self.providers.contains_key(&provider) => {
                Err(HostError::MissingReference {
                    key,
                    reference: provider,
                })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    committed: Arc<Objects>,
    pending: Option<Objects>,
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub(crate) unavailable: Option<String>,
    pub(crate) rejected_filters: HashSet<ObjectKey>,
}

/// Final outcome of the arbitration among all sublayers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerdictAction {
    Permit,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub action: VerdictAction,
    /// Rewrite requested by a redirect callout, if any.
    pub redirect: Option<RedirectTarget>,
    /// Filter which terminated the evaluation. `None` for the default permit.
    pub decided_by: Option<ObjectKey>,
}

impl Verdict {
    pub fn is_permit(&self) -> bool {
        self.action == VerdictAction::Permit
    }

    pub fn is_block(&self) -> bool {
        self.action == VerdictAction::Block
    }
}

/// In-memory filtering engine.
///
/// Arbitration follows the host rules:
/// - sublayers are evaluated in decreasing weight order, every sublayer
///   gets its own say
/// - inside a sublayer, matching filters are evaluated in decreasing weight
///   order; the first `Permit` or `Block` ends the sublayer, `Continue` moves
///   on to the next filter
/// - a `Block` from any sublayer is final, otherwise the flow is permitted
///
/// A filter pointing to a callout which is not registered has no opinion.
#[derive(Debug, Default)]
pub struct SimulatedEngine {
    state: Mutex<State>,
    pub(crate) faults: Mutex<Faults>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn committed(&self) -> Arc<Objects> {
        self.lock_state().committed.clone()
    }

    /// Read the objects as seen by the caller: inside a transaction that
    /// includes the uncommitted changes.
    fn view<R>(&self, f: impl FnOnce(&Objects) -> R) -> R {
        let state = self.lock_state();
        match &state.pending {
            Some(pending) => f(pending),
            None => f(&state.committed),
        }
    }

    /// Apply a change. Outside a transaction every call is its own atomic
    /// transaction. `f` must validate before mutating.
    fn modify<R>(
        &self,
        f: impl FnOnce(&mut Objects) -> Result<R, HostError>,
    ) -> Result<R, HostError> {
        let mut state = self.lock_state();
        let State { committed, pending } = &mut *state;
        match pending {
            Some(pending) => f(pending),
            None => {
                let mut objects = Objects::clone(committed);
                let result = f(&mut objects)?;
                *committed = Arc::new(objects);
                Ok(result)
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.lock_state().pending.is_some()
    }

    /// Committed filters, all providers.
    pub fn filters(&self) -> Vec<Filter> {
        self.committed().filters.values().cloned().collect()
    }

    pub fn filter(&self, key: ObjectKey) -> Option<Filter> {
        self.committed().filters.get(&key).cloned()
    }

    pub fn has_object(&self, key: ObjectKey) -> bool {
        let objects = self.committed();
        objects.providers.contains_key(&key)
            || objects.sublayers.contains_key(&key)
            || objects.callouts.contains_key(&key)
            || objects.filters.contains_key(&key)
    }

    /// Deliver a classify event and arbitrate the result.
    ///
    /// Callouts are invoked on the caller's thread, without holding any
    /// engine lock.
    pub fn classify(&self, event: &ClassifyEvent) -> Verdict {
        let objects = self.committed();

        let mut sublayers: Vec<&Sublayer> = objects.sublayers.values().collect();
        sublayers.sort_by(|a, b| b.weight.cmp(&a.weight));

        let mut redirect = None;
        let mut permitted_by = None;
        for sublayer in sublayers {
            let mut filters: Vec<&Filter> = objects
                .filters
                .values()
                .filter(|filter| filter.sublayer == sublayer.key && filter.layer == event.layer)
                .filter(|filter| filter.matches(event))
                .collect();
            filters.sort_by(|a, b| b.weight.cmp(&a.weight));

            for filter in filters {
                let decision = match filter.action {
                    FilterAction::Permit => Decision::Permit,
                    FilterAction::Block => Decision::Block,
                    FilterAction::Callout(key) => match objects.callouts.get(&key) {
                        Some(callout) if callout.registration.layer == event.layer => {
                            callout.function.classify(event)
                        }
                        _ => Decision::Continue,
                    },
                };
                match decision {
                    Decision::Continue => continue,
                    Decision::Block => {
                        log::trace!("{event}: blocked by filter {}", filter.key);
                        return Verdict {
                            action: VerdictAction::Block,
                            redirect: None,
                            decided_by: Some(filter.key),
                        };
                    }
                    Decision::Permit => {
                        permitted_by.get_or_insert(filter.key);
                        break;
                    }
                    Decision::Redirect(target) => {
                        redirect.get_or_insert(target);
                        permitted_by.get_or_insert(filter.key);
                        break;
                    }
                }
            }
        }

        Verdict {
            action: VerdictAction::Permit,
            redirect,
            decided_by: permitted_by,
        }
    }
}

impl HostEngine for SimulatedEngine {
    fn open(&self) -> Result<(), HostError> {
        match &self.lock_faults().unavailable {
            Some(reason) => Err(HostError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn begin_transaction(&self) -> Result<(), HostError> {
        let mut state = self.lock_state();
        if state.pending.is_some() {
            return Err(HostError::TransactionInProgress);
        }
        state.pending = Some(Objects::clone(&state.committed));
        Ok(())
    }

    fn commit_transaction(&self) -> Result<(), HostError> {
        let mut state = self.lock_state();
        let pending = state.pending.take().ok_or(HostError::NoTransaction)?;
        state.committed = Arc::new(pending);
        Ok(())
    }

    fn abort_transaction(&self) -> Result<(), HostError> {
        let mut state = self.lock_state();
        state.pending.take().ok_or(HostError::NoTransaction)?;
        Ok(())
    }

    fn add_provider(&self, provider: &Provider) -> Result<(), HostError> {
        self.modify(|objects| {
            if objects.providers.contains_key(&provider.key) {
                return Err(HostError::AlreadyExists(provider.key));
            }
            objects.providers.insert(provider.key, provider.clone());
            Ok(())
        })
    }

    fn get_provider(&self, key: ObjectKey) -> Result<Option<Provider>, HostError> {
        Ok(self.view(|objects| objects.providers.get(&key).cloned()))
    }

    fn delete_provider(&self, key: ObjectKey) -> Result<(), HostError> {
        self.modify(|objects| {
            if !objects.providers.contains_key(&key) {
                return Err(HostError::NotFound(key));
            }
            if let Some(by) = objects.provider_user(key) {
                return Err(HostError::InUse { key, by });
            }
            objects.providers.remove(&key);
            Ok(())
        })
    }

    fn add_sublayer(&self, sublayer: &Sublayer) -> Result<(), HostError> {
        self.modify(|objects| {
            if objects.sublayers.contains_key(&sublayer.key) {
                return Err(HostError::AlreadyExists(sublayer.key));
            }
            objects.check_provider(sublayer.key, sublayer.provider)?;
            objects.sublayers.insert(sublayer.key, sublayer.clone());
            Ok(())
        })
    }

    fn get_sublayer(&self, key: ObjectKey) -> Result<Option<Sublayer>, HostError> {
        Ok(self.view(|objects| objects.sublayers.get(&key).cloned()))
    }

    fn delete_sublayer(&self, key: ObjectKey) -> Result<(), HostError> {
        self.modify(|objects| {
            if !objects.sublayers.contains_key(&key) {
                return Err(HostError::NotFound(key));
            }
            if let Some(filter) = objects.filters.values().find(|f| f.sublayer == key) {
                return Err(HostError::InUse { key, by: filter.key });
            }
            objects.sublayers.remove(&key);
            Ok(())
        })
    }

    fn register_callout(
        &self,
        registration: &CalloutRegistration,
        callout: Arc<dyn Callout>,
    ) -> Result<(), HostError> {
        self.modify(|objects| {
            if objects.callouts.contains_key(&registration.key) {
                return Err(HostError::AlreadyExists(registration.key));
            }
            objects.check_provider(registration.key, Some(registration.provider))?;
            objects.callouts.insert(
                registration.key,
                RegisteredCallout {
                    registration: registration.clone(),
                    function: callout,
                },
            );
            Ok(())
        })
    }

    fn unregister_callout(&self, key: ObjectKey) -> Result<(), HostError> {
        self.modify(|objects| match objects.callouts.remove(&key) {
            Some(_) => Ok(()),
            None => Err(HostError::NotFound(key)),
        })
    }

    fn callouts_by_provider(
        &self,
        provider: ObjectKey,
    ) -> Result<Vec<CalloutRegistration>, HostError> {
        Ok(self.view(|objects| {
            objects
                .callouts
                .values()
                .filter(|callout| callout.registration.provider == provider)
                .map(|callout| callout.registration.clone())
                .collect()
        }))
    }

    fn add_filter(&self, filter: &Filter) -> Result<(), HostError> {
        if self.lock_faults().rejected_filters.contains(&filter.key) {
            return Err(HostError::Rejected {
                key: filter.key,
                reason: "injected failure".to_string(),
            });
        }
        self.modify(|objects| {
            if objects.filters.contains_key(&filter.key) {
                return Err(HostError::AlreadyExists(filter.key));
            }
            if !objects.sublayers.contains_key(&filter.sublayer) {
                return Err(HostError::MissingReference {
                    key: filter.key,
                    reference: filter.sublayer,
                });
            }
            objects.check_provider(filter.key, filter.provider)?;
            objects.filters.insert(filter.key, filter.clone());
            Ok(())
        })
    }

    fn delete_filter(&self, key: ObjectKey) -> Result<(), HostError> {
        self.modify(|objects| match objects.filters.remove(&key) {
            Some(_) => Ok(()),
            None => Err(HostError::NotFound(key)),
        })
    }

    fn filters_by_provider(&self, provider: ObjectKey) -> Result<Vec<Filter>, HostError> {
        Ok(self.view(|objects| {
            objects
                .filters
                .values()
                .filter(|filter| filter.provider == Some(provider))
                .cloned()
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use split_core::{AddressFamily, CalloutRole, Layer, ProcessIdentity};

    use super::*;
    use crate::Condition;

    const PROVIDER: ObjectKey = ObjectKey::from_fields(1, 0, 0, [0; 8]);
    const HIGH: ObjectKey = ObjectKey::from_fields(2, 0, 0, [0; 8]);
    const LOW: ObjectKey = ObjectKey::from_fields(3, 0, 0, [0; 8]);
    const CALLOUT: ObjectKey = ObjectKey::from_fields(4, 0, 0, [0; 8]);
    const LAYER: Layer = Layer::new(CalloutRole::AuthConnect, AddressFamily::V4);

    fn filter(n: u32, sublayer: ObjectKey, weight: u16, action: FilterAction) -> Filter {
        Filter {
            key: ObjectKey::from_fields(100 + n, 0, 0, [0; 8]),
            name: format!("filter {n}"),
            layer: LAYER,
            sublayer,
            provider: Some(PROVIDER),
            weight,
            conditions: vec![],
            action,
        }
    }

    fn engine() -> SimulatedEngine {
        let engine = SimulatedEngine::new();
        engine
            .add_provider(&Provider {
                key: PROVIDER,
                name: "test".to_string(),
            })
            .unwrap();
        for (key, weight) in [(HIGH, 200), (LOW, 100)] {
            engine
                .add_sublayer(&Sublayer {
                    key,
                    name: "sublayer".to_string(),
                    provider: Some(PROVIDER),
                    weight,
                })
                .unwrap();
        }
        engine
    }

    fn event(path: &str) -> ClassifyEvent {
        ClassifyEvent::auth_connect(
            ProcessIdentity::new(1, path),
            "192.168.1.10:50000".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
        )
    }

    #[test]
    fn default_is_permit() {
        let verdict = engine().classify(&event("c:\\a.exe"));
        assert!(verdict.is_permit());
        assert_eq!(verdict.decided_by, None);
    }

    #[test]
    fn block_in_any_sublayer_wins() {
        let engine = engine();
        engine
            .add_filter(&filter(1, HIGH, 10, FilterAction::Permit))
            .unwrap();
        engine
            .add_filter(&filter(2, LOW, 10, FilterAction::Block))
            .unwrap();
        assert!(engine.classify(&event("c:\\a.exe")).is_block());
    }

    #[test]
    fn callout_permit_overrides_lower_weight_block_in_same_sublayer() {
        let engine = engine();
        let callout: Arc<dyn Callout> = Arc::new(|event: &ClassifyEvent| {
            if event.process.path.ends_with("split.exe") {
                Decision::Permit
            } else {
                Decision::Continue
            }
        });
        engine
            .register_callout(
                &CalloutRegistration {
                    key: CALLOUT,
                    name: "callout".to_string(),
                    layer: LAYER,
                    provider: PROVIDER,
                },
                callout,
            )
            .unwrap();
        engine
            .add_filter(&filter(1, LOW, 0, FilterAction::Block))
            .unwrap();
        let bypass = filter(2, LOW, 10, FilterAction::Callout(CALLOUT));
        engine.add_filter(&bypass).unwrap();

        let verdict = engine.classify(&event("c:\\split.exe"));
        assert!(verdict.is_permit());
        assert_eq!(verdict.decided_by, Some(bypass.key));
        assert!(engine.classify(&event("c:\\other.exe")).is_block());

        // Unregistered callout: no opinion
        engine.unregister_callout(CALLOUT).unwrap();
        assert!(engine.classify(&event("c:\\split.exe")).is_block());
    }

    #[test]
    fn conditions_restrict_filters() {
        let engine = engine();
        let mut block = filter(1, LOW, 10, FilterAction::Block);
        block.conditions = vec![Condition::AppPath(vec!["c:\\bad.exe".to_string()])];
        engine.add_filter(&block).unwrap();
        assert!(engine.classify(&event("C:\\BAD.exe")).is_block());
        assert!(engine.classify(&event("c:\\good.exe")).is_permit());
    }

    #[test]
    fn transaction_is_invisible_until_commit() {
        let engine = engine();
        engine.begin_transaction().unwrap();
        assert_eq!(engine.begin_transaction(), Err(HostError::TransactionInProgress));
        engine
            .add_filter(&filter(1, LOW, 10, FilterAction::Block))
            .unwrap();
        assert_eq!(engine.filters_by_provider(PROVIDER).unwrap().len(), 1);
        assert!(engine.classify(&event("c:\\a.exe")).is_permit());
        engine.commit_transaction().unwrap();
        assert!(engine.classify(&event("c:\\a.exe")).is_block());
    }

    #[test]
    fn abort_discards_changes() {
        let engine = engine();
        engine.begin_transaction().unwrap();
        engine
            .add_filter(&filter(1, LOW, 10, FilterAction::Block))
            .unwrap();
        engine.abort_transaction().unwrap();
        assert!(engine.filters().is_empty());
        assert_eq!(engine.abort_transaction(), Err(HostError::NoTransaction));
    }

    #[test]
    fn referential_integrity() {
        let engine = engine();
        let blocker = filter(1, LOW, 10, FilterAction::Block);
        engine.add_filter(&blocker).unwrap();
        assert_eq!(
            engine.add_filter(&blocker),
            Err(HostError::AlreadyExists(blocker.key))
        );
        assert_eq!(
            engine.delete_sublayer(LOW),
            Err(HostError::InUse {
                key: LOW,
                by: blocker.key
            })
        );
        assert!(matches!(
            engine.delete_provider(PROVIDER),
            Err(HostError::InUse { .. })
        ));
        let orphan = filter(2, ObjectKey::from_fields(9, 9, 9, [9; 8]), 1, FilterAction::Block);
        assert!(matches!(
            engine.add_filter(&orphan),
            Err(HostError::MissingReference { .. })
        ));

        engine.delete_filter(blocker.key).unwrap();
        assert!(engine.delete_filter(blocker.key).unwrap_err().is_not_found());
        engine.delete_sublayer(LOW).unwrap();
        engine.delete_sublayer(HIGH).unwrap();
        engine.delete_provider(PROVIDER).unwrap();
        assert!(!engine.has_object(PROVIDER));
    }
}
