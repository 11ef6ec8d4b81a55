//! Watch streams feeding the agent runtime

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use routebird_core::{ClusterEvent, EventKind, Trigger, TriggerSender};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::{debug, warn};

pub async fn watch_services(client: Client, sender: TriggerSender) {
    forward(Api::<Service>::all(client), sender, ClusterEvent::service).await
}

pub async fn watch_endpoint_slices(client: Client, sender: TriggerSender) {
    forward(
        Api::<EndpointSlice>::all(client),
        sender,
        ClusterEvent::endpoint_slice,
    )
    .await
}

/// Forward watch events until the stream ends
async fn forward<K>(api: Api<K>, sender: TriggerSender, to_event: fn(EventKind, K) -> ClusterEvent)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                if let Some(trigger) = translate(event, to_event) {
                    sender.send(trigger);
                }
            }
            Err(e) => warn!(error = %e, "Watch stream error"),
        }
    }
    warn!("Watch stream ended");
}

/// Map a watcher event onto a runtime trigger.
///
/// Objects replayed during a re-list are not forwarded one by one; the
/// completed re-list asks the runtime for a full resync instead.
fn translate<K>(
    event: watcher::Event<K>,
    to_event: fn(EventKind, K) -> ClusterEvent,
) -> Option<Trigger> {
    match event {
        watcher::Event::Apply(obj) => Some(Trigger::Changed(to_event(EventKind::Update, obj))),
        watcher::Event::Delete(obj) => Some(Trigger::Changed(to_event(EventKind::Delete, obj))),
        watcher::Event::Init => {
            debug!("Watch re-list started");
            None
        }
        watcher::Event::InitApply(_) => None,
        watcher::Event::InitDone => Some(Trigger::WatchRestarted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use routebird_core::ObservedObject;

    fn service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("web".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_and_delete_become_changes() {
        match translate(watcher::Event::Apply(service("api")), ClusterEvent::service) {
            Some(Trigger::Changed(event)) => {
                assert_eq!(event.kind, EventKind::Update);
                assert_eq!(event.key, "web/api");
                assert!(matches!(event.object, ObservedObject::Service(_)));
            }
            other => panic!("unexpected trigger {other:?}"),
        }

        match translate(watcher::Event::Delete(service("api")), ClusterEvent::service) {
            Some(Trigger::Changed(event)) => assert_eq!(event.kind, EventKind::Delete),
            other => panic!("unexpected trigger {other:?}"),
        }
    }

    #[test]
    fn test_relist_collapses_into_restart() {
        assert!(translate(watcher::Event::<Service>::Init, ClusterEvent::service).is_none());
        assert!(translate(watcher::Event::InitApply(service("api")), ClusterEvent::service).is_none());
        assert!(matches!(
            translate(watcher::Event::<Service>::InitDone, ClusterEvent::service),
            Some(Trigger::WatchRestarted)
        ));
    }
}
