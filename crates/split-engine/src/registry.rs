use std::sync::Arc;

use callouts::{EngineContext, callout_for};
use host_engine::{CalloutRegistration, HostEngine};
use split_core::Layer;

use crate::{error::EngineError, namespace::NamespaceIdentity, transaction::in_transaction};

/// Register the callout of every layer, bound to `ctx`.
pub fn register_callouts(
    host: &dyn HostEngine,
    namespace: &NamespaceIdentity,
    ctx: &Arc<EngineContext>,
) -> Result<(), EngineError> {
    in_transaction(host, || {
        for layer in Layer::all() {
            let registration = CalloutRegistration {
                key: layer.callout_key(),
                name: format!("Split tunnel {layer}"),
                layer,
                provider: namespace.provider,
            };
            host.register_callout(&registration, callout_for(layer, ctx.clone()))?;
        }
        Ok(())
    })?;
    log::debug!("callouts registered");
    Ok(())
}

/// Unregister every callout owned by our provider.
pub fn unregister_callouts(
    host: &dyn HostEngine,
    namespace: &NamespaceIdentity,
) -> Result<(), EngineError> {
    let registered = host.callouts_by_provider(namespace.provider)?;
    if registered.is_empty() {
        return Ok(());
    }
    in_transaction(host, || {
        for callout in &registered {
            match host.unregister_callout(callout.key) {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    })?;
    log::debug!("{} callouts unregistered", registered.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use classification::ClassificationStore;
    use host_engine::SimulatedEngine;
    use split_core::InterfaceBinding;

    use super::*;

    #[test]
    fn register_and_unregister() {
        let host = SimulatedEngine::new();
        let namespace = NamespaceIdentity::default();
        namespace.activate(&host).unwrap();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(ClassificationStore::new()),
            InterfaceBinding::default(),
        ));

        register_callouts(&host, &namespace, &ctx).unwrap();
        assert!(Layer::all().all(|layer| host.has_object(layer.callout_key())));
        assert!(register_callouts(&host, &namespace, &ctx).is_err());
        assert_eq!(host.callouts_by_provider(namespace.provider).unwrap().len(), 8);

        unregister_callouts(&host, &namespace).unwrap();
        assert!(host.callouts_by_provider(namespace.provider).unwrap().is_empty());
        unregister_callouts(&host, &namespace).unwrap();
    }
}
