//! Reflector: let one peer enumerate the methods registered on the other.
//!
//! A built-in contract with two request methods on the server side:
//!
//! - `reflector/supported-versions` → `{ "versions": [1] }`
//! - `reflector/v1/list-registered-request-and-notification-types` → one
//!   entry per dispatch-table row, with type descriptions taken from the
//!   registered serializers
//!
//! Call [`register_reflector`] on the channel whose table should be
//! visible; the peer queries it with the descriptors from
//! [`supported_versions`] and [`list_registered_types`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::{Contract, ContractBuilder};
use crate::error::RegistrationError;
use crate::serializer;
use crate::typed::{Registrations, TypedChannel};
use crate::types::{request_type, MethodKind, RequestType};

/// Method name of the version handshake.
pub const SUPPORTED_VERSIONS_METHOD: &str = "reflector/supported-versions";

/// Method name of the v1 listing.
pub const LIST_TYPES_METHOD: &str =
    "reflector/v1/list-registered-request-and-notification-types";

/// Result of `reflector/supported-versions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedVersions {
    pub versions: Vec<u32>,
}

/// `kind` field of a listed entry; serializes as `"request"` or
/// `"notification"` exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListedKind {
    Request,
    Notification,
}

/// One dispatch-table row as reported by the listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedType {
    pub kind: ListedKind,
    pub method: String,
    #[serde(rename = "paramsType", skip_serializing_if = "Option::is_none")]
    pub params_type: Option<Value>,
    #[serde(rename = "resultType", skip_serializing_if = "Option::is_none")]
    pub result_type: Option<Value>,
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<Value>,
}

/// Descriptor for the version handshake.
pub fn supported_versions() -> RequestType<(), SupportedVersions, ()> {
    request_type()
        .method(SUPPORTED_VERSIONS_METHOD)
        .result(serializer::of::<SupportedVersions>())
        .build()
}

/// Descriptor for the v1 listing.
pub fn list_registered_types() -> RequestType<(), Vec<ListedType>, ()> {
    request_type()
        .method(LIST_TYPES_METHOD)
        .result(serializer::of::<Vec<ListedType>>())
        .build()
}

/// The reflector as a contract value (server side carries both requests).
pub fn reflector_contract() -> Contract {
    let mut builder = ContractBuilder::new("reflector").tag("builtin");
    builder.server_request(
        SUPPORTED_VERSIONS_METHOD,
        request_type()
            .result(serializer::of::<SupportedVersions>())
            .build(),
    );
    builder.server_request(
        LIST_TYPES_METHOD,
        request_type()
            .result(serializer::of::<Vec<ListedType>>())
            .build(),
    );
    builder.build()
}

/// Install the reflector's request handlers on `channel`.
///
/// The listing reflects the dispatch table at the time each request is
/// handled, including the reflector's own methods.
pub fn register_reflector<C, S>(
    channel: &TypedChannel<C, S>,
) -> Result<Registrations, RegistrationError>
where
    C: Clone + Send + Sync + 'static,
    S: Send + 'static,
{
    let registrations = Registrations::new();

    registrations.push(channel.register_request(
        &supported_versions(),
        |_: (), _ctx| async move {
            Ok(SupportedVersions { versions: vec![1] })
        },
    )?);

    let snapshot = channel.clone();
    let listing = channel.register_request(&list_registered_types(), move |_: (), _ctx| {
        let snapshot = snapshot.clone();
        async move {
            let entries = snapshot
                .registered_methods()
                .into_iter()
                .map(|m| ListedType {
                    kind: match m.kind {
                        MethodKind::Request => ListedKind::Request,
                        MethodKind::Notification => ListedKind::Notification,
                    },
                    method: m.method,
                    params_type: m.types.params,
                    result_type: m.types.result,
                    error_type: m.types.error,
                })
                .collect::<Vec<_>>();
            Ok(entries)
        }
    });
    match listing {
        Ok(registration) => registrations.push(registration),
        Err(err) => {
            registrations.dispose();
            return Err(err);
        }
    }

    Ok(registrations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamChannelFactory;
    use crate::transport::pair;
    use crate::typed::TypedChannelOptions;
    use crate::types::notification_type;

    fn typed_pair() -> (TypedChannel, TypedChannel) {
        let (a, b) = pair();
        (
            TypedChannel::new(
                StreamChannelFactory::new(Box::new(a)),
                TypedChannelOptions::default(),
            ),
            TypedChannel::new(
                StreamChannelFactory::new(Box::new(b)),
                TypedChannelOptions::default(),
            ),
        )
    }

    #[tokio::test]
    async fn test_supported_versions_includes_v1() {
        let (client, server) = typed_pair();
        register_reflector(&server).unwrap();
        client.start().unwrap();
        server.start().unwrap();

        let versions = client.request(&supported_versions(), ()).await.unwrap();
        assert!(versions.versions.contains(&1));
    }

    #[tokio::test]
    async fn test_listing_reports_registered_methods() {
        let (client, server) = typed_pair();

        let echo = request_type()
            .method("echo")
            .params(serializer::of::<String>())
            .result(serializer::of::<String>())
            .build();
        server
            .register_request(&echo, |s: String, _ctx| async move { Ok(s) })
            .unwrap();

        let tick = notification_type()
            .method("tick")
            .params(serializer::of::<u64>())
            .build();
        server
            .register_notification(&tick, |_: u64, _ctx| async { Ok(()) })
            .unwrap();

        register_reflector(&server).unwrap();
        client.start().unwrap();
        server.start().unwrap();

        let listed = client.request(&list_registered_types(), ()).await.unwrap();

        let echo_entry = listed.iter().find(|e| e.method == "echo").unwrap();
        assert_eq!(echo_entry.kind, ListedKind::Request);
        assert!(echo_entry.params_type.is_some());
        assert!(echo_entry.result_type.is_some());

        let tick_entry = listed.iter().find(|e| e.method == "tick").unwrap();
        assert_eq!(tick_entry.kind, ListedKind::Notification);
        assert!(tick_entry.result_type.is_none());

        // The reflector's own methods are part of the table.
        assert!(listed.iter().any(|e| e.method == SUPPORTED_VERSIONS_METHOD));
        assert!(listed.iter().any(|e| e.method == LIST_TYPES_METHOD));
    }

    #[test]
    fn test_reflector_contract_shape() {
        let contract = reflector_contract();
        assert_eq!(contract.name(), "reflector");
        assert!(contract.server().contains(SUPPORTED_VERSIONS_METHOD));
        assert!(contract.server().contains(LIST_TYPES_METHOD));
        assert!(contract.client().is_empty());
    }

    #[test]
    fn test_listed_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ListedKind::Request).unwrap(),
            serde_json::json!("request")
        );
        assert_eq!(
            serde_json::to_value(ListedKind::Notification).unwrap(),
            serde_json::json!("notification")
        );
    }
}
