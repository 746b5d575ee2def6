//! Decode predicates.
//!
//! The request decoder asks one question per frame: should this
//! `(api_key, api_version)` be fully decoded, or passed through opaque? The
//! answer starts out "only what the connection bootstrap itself needs" and
//! becomes "whatever the filter chain subscribed to" the moment the upstream
//! filters are fixed. The delegate slot is installed exactly once, before
//! the outbound channel goes active, and read-only afterwards.

use kafka_protocol::messages::ApiKey;

use crate::proxy::constants::MAX_API_KEY;

/// Predicate derived from the filter chain's subscriptions: answers true
/// exactly for the api keys some filter asked to intercept. Backed by dense
/// boolean tables; api keys are small and this sits on the per-frame path.
#[derive(Debug, Clone)]
pub struct SubscriptionPredicate {
    requests: [bool; MAX_API_KEY],
    responses: [bool; MAX_API_KEY],
}

impl Default for SubscriptionPredicate {
    fn default() -> Self {
        Self {
            requests: [false; MAX_API_KEY],
            responses: [false; MAX_API_KEY],
        }
    }
}

impl SubscriptionPredicate {
    pub fn from_api_keys(
        request_keys: impl IntoIterator<Item = ApiKey>,
        response_keys: impl IntoIterator<Item = ApiKey>,
    ) -> Self {
        let mut predicate = Self::default();
        for key in request_keys {
            predicate.requests[key as i16 as usize] = true;
        }
        for key in response_keys {
            predicate.responses[key as i16 as usize] = true;
        }
        predicate
    }

    pub fn should_decode_request(&self, api_key: i16) -> bool {
        usize::try_from(api_key)
            .ok()
            .and_then(|i| self.requests.get(i))
            .copied()
            .unwrap_or(false)
    }

    pub fn should_decode_response(&self, api_key: i16) -> bool {
        usize::try_from(api_key)
            .ok()
            .and_then(|i| self.responses.get(i))
            .copied()
            .unwrap_or(false)
    }
}

/// The per-connection predicate handed to the request decoder.
///
/// Until the delegate is installed, only the frames the connection bootstrap
/// must see are decoded: `ApiVersions` always (the frontend intercepts it),
/// and the SASL handshake pair while authentication offload is active and
/// the handshake has not completed. Afterwards the installed subscription
/// predicate decides, with the SASL force-decode still applying until the
/// handshake finishes.
#[derive(Debug, Default)]
pub struct SaslDecodePredicate {
    authentication_offload: bool,
    handshake_complete: bool,
    delegate: Option<SubscriptionPredicate>,
}

impl SaslDecodePredicate {
    pub fn new(authentication_offload: bool) -> Self {
        Self {
            authentication_offload,
            handshake_complete: false,
            delegate: None,
        }
    }

    pub fn authentication_offload_enabled(&self) -> bool {
        self.authentication_offload
    }

    /// Install the subscription predicate once the filter chain is known.
    /// Later calls replace nothing: install-once is part of the contract.
    pub fn install_delegate(&mut self, delegate: SubscriptionPredicate) {
        if self.delegate.is_none() {
            self.delegate = Some(delegate);
        }
    }

    pub fn delegate_installed(&self) -> bool {
        self.delegate.is_some()
    }

    /// Mark the SASL handshake as finished; the force-decode window closes.
    pub fn handshake_complete(&mut self) {
        self.handshake_complete = true;
    }

    fn forcing_sasl_decode(&self, api_key: i16) -> bool {
        self.authentication_offload
            && !self.handshake_complete
            && (api_key == ApiKey::SaslHandshake as i16
                || api_key == ApiKey::SaslAuthenticate as i16)
    }

    pub fn should_decode_request(&self, api_key: i16, _api_version: i16) -> bool {
        if api_key == ApiKey::ApiVersions as i16 && self.delegate.is_none() {
            // The frontend intercepts ApiVersions before any upstream exists.
            return true;
        }
        if self.forcing_sasl_decode(api_key) {
            return true;
        }
        self.delegate
            .as_ref()
            .map(|d| d.should_decode_request(api_key))
            .unwrap_or(false)
    }

    pub fn should_decode_response(&self, api_key: i16, _api_version: i16) -> bool {
        if self.forcing_sasl_decode(api_key) {
            return true;
        }
        self.delegate
            .as_ref()
            .map(|d| d.should_decode_response(api_key))
            .unwrap_or(false)
    }
}
