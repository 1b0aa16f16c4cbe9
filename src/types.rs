//! Method descriptors.
//!
//! A descriptor is an immutable record describing one method: its name,
//! its kind (request or notification), the serializers for its params -
//! and, for requests, its result and error data - plus the optional-request
//! marker. Descriptors are `Arc`-backed: clones share identity, which is
//! what registration uses to tell "same descriptor again" from "different
//! descriptor under the same name".
//!
//! Descriptors may be built without a method name; a contract binds the
//! map key into the descriptor via [`RequestType::with_method`] when it is
//! assembled.
//!
//! # Example
//!
//! ```
//! use peerwire::types::request_type;
//! use peerwire::serializer;
//!
//! let calculate = request_type()
//!     .method("calculate")
//!     .params(serializer::of::<Vec<String>>())
//!     .result(serializer::of::<String>())
//!     .build();
//! assert_eq!(calculate.method(), Some("calculate"));
//! ```

use std::sync::Arc;

use serde_json::Value;

use crate::serializer::{self, SharedSerializer};

/// What kind of method a descriptor (or dispatch-table entry) describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Request,
    Notification,
}

struct RequestTypeInner<P, R, E> {
    method: Option<String>,
    params: SharedSerializer<P>,
    result: SharedSerializer<R>,
    error: SharedSerializer<E>,
    optional: bool,
}

/// Descriptor for a request method.
///
/// `P`, `R`, `E` are the params, result, and error-data types.
pub struct RequestType<P, R, E> {
    inner: Arc<RequestTypeInner<P, R, E>>,
}

impl<P, R, E> Clone for RequestType<P, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: 'static, R: 'static, E: 'static> RequestType<P, R, E> {
    /// The bound method name, if any.
    pub fn method(&self) -> Option<&str> {
        self.inner.method.as_deref()
    }

    /// Whether `METHOD_NOT_FOUND` resolves to the not-found sentinel
    /// instead of an error.
    pub fn is_optional(&self) -> bool {
        self.inner.optional
    }

    pub fn params(&self) -> &SharedSerializer<P> {
        &self.inner.params
    }

    pub fn result(&self) -> &SharedSerializer<R> {
        &self.inner.result
    }

    pub fn error(&self) -> &SharedSerializer<E> {
        &self.inner.error
    }

    /// Clone with the method name bound. The clone is a new descriptor
    /// identity sharing the serializers.
    pub fn with_method(&self, method: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RequestTypeInner {
                method: Some(method.into()),
                params: self.inner.params.clone(),
                result: self.inner.result.clone(),
                error: self.inner.error.clone(),
                optional: self.inner.optional,
            }),
        }
    }

    /// Identity of this descriptor allocation.
    #[cfg(test)]
    pub(crate) fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn type_info(&self) -> MethodTypeInfo {
        MethodTypeInfo {
            params: self.inner.params.type_description(),
            result: self.inner.result.type_description(),
            error: self.inner.error.type_description(),
        }
    }
}

struct NotificationTypeInner<P> {
    method: Option<String>,
    params: SharedSerializer<P>,
}

/// Descriptor for a notification method.
pub struct NotificationType<P> {
    inner: Arc<NotificationTypeInner<P>>,
}

impl<P> Clone for NotificationType<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: 'static> NotificationType<P> {
    pub fn method(&self) -> Option<&str> {
        self.inner.method.as_deref()
    }

    pub fn params(&self) -> &SharedSerializer<P> {
        &self.inner.params
    }

    /// Clone with the method name bound.
    pub fn with_method(&self, method: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(NotificationTypeInner {
                method: Some(method.into()),
                params: self.inner.params.clone(),
            }),
        }
    }

    pub(crate) fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn type_info(&self) -> MethodTypeInfo {
        MethodTypeInfo {
            params: self.inner.params.type_description(),
            result: None,
            error: None,
        }
    }
}

/// Type descriptions a descriptor contributes to reflection.
#[derive(Debug, Clone, Default)]
pub struct MethodTypeInfo {
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

/// Builder for [`RequestType`]. Each serializer setter may change the
/// corresponding type parameter.
pub struct RequestTypeBuilder<P, R, E> {
    method: Option<String>,
    params: SharedSerializer<P>,
    result: SharedSerializer<R>,
    error: SharedSerializer<E>,
    optional: bool,
}

/// Start a request descriptor with the default serializers: empty-object
/// params, void result, void error data.
pub fn request_type() -> RequestTypeBuilder<(), (), ()> {
    RequestTypeBuilder {
        method: None,
        params: serializer::empty_object(),
        result: serializer::void_null(),
        error: serializer::void_null(),
        optional: false,
    }
}

impl<P, R, E> RequestTypeBuilder<P, R, E> {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Mark the request optional: an unknown method at the peer resolves
    /// to the not-found sentinel instead of an error.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn params<P2>(self, params: SharedSerializer<P2>) -> RequestTypeBuilder<P2, R, E> {
        RequestTypeBuilder {
            method: self.method,
            params,
            result: self.result,
            error: self.error,
            optional: self.optional,
        }
    }

    pub fn result<R2>(self, result: SharedSerializer<R2>) -> RequestTypeBuilder<P, R2, E> {
        RequestTypeBuilder {
            method: self.method,
            params: self.params,
            result,
            error: self.error,
            optional: self.optional,
        }
    }

    pub fn error<E2>(self, error: SharedSerializer<E2>) -> RequestTypeBuilder<P, R, E2> {
        RequestTypeBuilder {
            method: self.method,
            params: self.params,
            result: self.result,
            error,
            optional: self.optional,
        }
    }

    pub fn build(self) -> RequestType<P, R, E> {
        RequestType {
            inner: Arc::new(RequestTypeInner {
                method: self.method,
                params: self.params,
                result: self.result,
                error: self.error,
                optional: self.optional,
            }),
        }
    }
}

/// Builder for [`NotificationType`].
pub struct NotificationTypeBuilder<P> {
    method: Option<String>,
    params: SharedSerializer<P>,
}

/// Start a notification descriptor with empty-object params.
pub fn notification_type() -> NotificationTypeBuilder<()> {
    NotificationTypeBuilder {
        method: None,
        params: serializer::empty_object(),
    }
}

impl<P> NotificationTypeBuilder<P> {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn params<P2>(self, params: SharedSerializer<P2>) -> NotificationTypeBuilder<P2> {
        NotificationTypeBuilder {
            method: self.method,
            params,
        }
    }

    pub fn build(self) -> NotificationType<P> {
        NotificationType {
            inner: Arc::new(NotificationTypeInner {
                method: self.method,
                params: self.params,
            }),
        }
    }
}

/// Request descriptor that skips static validation: params, result, and
/// error data are raw JSON values.
pub fn unverified_request_type(method: impl Into<String>) -> RequestType<Value, Value, Value> {
    request_type()
        .method(method)
        .params(serializer::any())
        .result(serializer::any())
        .error(serializer::any())
        .build()
}

/// Notification descriptor that skips static validation.
pub fn unverified_notification_type(method: impl Into<String>) -> NotificationType<Value> {
    notification_type()
        .method(method)
        .params(serializer::any())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let desc = request_type().method("noop").build();
        assert_eq!(desc.method(), Some("noop"));
        assert!(!desc.is_optional());

        // Default params serializer yields `{}`, default result is void.
        assert_eq!(desc.params().serialize(&()).unwrap(), json!({}));
        assert_eq!(desc.result().serialize(&()).unwrap(), json!(null));
    }

    #[test]
    fn test_with_method_binds_name_and_changes_identity() {
        let unnamed = request_type().build();
        assert_eq!(unnamed.method(), None);

        let bound = unnamed.with_method("calculate");
        assert_eq!(bound.method(), Some("calculate"));
        assert_ne!(unnamed.token(), bound.token());

        // Plain clones share identity.
        assert_eq!(bound.token(), bound.clone().token());
    }

    #[test]
    fn test_distinct_builds_have_distinct_identity() {
        let a = notification_type().method("progress").build();
        let b = notification_type().method("progress").build();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_unverified_uses_any_serializer() {
        let desc = unverified_request_type("raw");
        let value = json!({"whatever": [1, 2]});
        assert_eq!(desc.params().serialize(&value).unwrap(), value);
        assert_eq!(desc.result().deserialize(json!("x")).unwrap(), json!("x"));
    }

    #[test]
    fn test_optional_marker() {
        let desc = request_type().method("maybe").optional().build();
        assert!(desc.is_optional());
        // with_method keeps the marker.
        assert!(desc.with_method("maybe2").is_optional());
    }
}
