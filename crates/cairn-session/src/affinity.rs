//! Session affinity: choosing the incoming id and building the outgoing token.
//!
//! A request may carry several candidate tokens (one per cookie, or one in
//! the URL). [`AffinityManager::set_next_id`] walks them in order, and once a
//! session is bound [`AffinityManager::encode_token`] produces the token the
//! transport sends back, with this server's clone token merged into the chain.

use std::collections::{HashSet, VecDeque};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::codec::{IdCodec, ParsedId};
use crate::config::SessionManagerConfig;
use crate::session::Session;

/// Per-request affinity scratch state.
#[derive(Debug, Clone, Default)]
pub struct AffinityContext {
    candidates: VecDeque<String>,
    requested: Option<ParsedId>,
    response: Option<ParsedId>,

    /// The incoming id arrived over a transport that guarantees uniqueness.
    pub transport_unique: bool,

    /// Caller identity handed to the access check.
    pub principal: Option<String>,
}

impl AffinityContext {
    /// Context for a request carrying `candidates` in transport order.
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_transport_unique(mut self, unique: bool) -> Self {
        self.transport_unique = unique;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// The currently selected incoming id.
    pub fn requested(&self) -> Option<&ParsedId> {
        self.requested.as_ref()
    }

    /// The outgoing id, once a session is bound to the request.
    pub fn response(&self) -> Option<&ParsedId> {
        self.response.as_ref()
    }

    /// Candidates not yet tried.
    pub fn remaining_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Bind the outgoing id. A chain computed for the same base id is kept.
    pub fn set_response(&mut self, base_id: &str, version: u32) {
        let chain = self
            .response
            .take()
            .filter(|r| r.base_id == base_id)
            .and_then(|r| r.clone_chain);
        self.response = Some(ParsedId::new(version, base_id, chain));
    }
}

/// Decides which incoming id to honor and what token to send back.
#[derive(Debug)]
pub struct AffinityManager {
    codec: IdCodec,
    clone_id: RwLock<Option<String>>,
    no_switchback: bool,
    expected_clone_ids: Option<HashSet<String>>,
    url_parameter: String,
}

impl AffinityManager {
    pub fn new(config: &SessionManagerConfig) -> Self {
        Self {
            codec: IdCodec::from_config(config),
            clone_id: RwLock::new(config.runtime.clone_id.clone()),
            no_switchback: config.no_affinity_switchback,
            expected_clone_ids: config
                .expected_clone_ids
                .as_ref()
                .map(|ids| ids.iter().cloned().collect()),
            url_parameter: config.url_parameter.clone(),
        }
    }

    pub fn codec(&self) -> &IdCodec {
        &self.codec
    }

    /// This server's clone token, if clustering is configured.
    pub fn clone_id(&self) -> Option<String> {
        self.clone_id.read().clone()
    }

    pub fn set_clone_id(&self, clone_id: Option<String>) {
        *self.clone_id.write() = clone_id;
    }

    /// Advance to the next well-formed candidate.
    ///
    /// Malformed candidates are skipped. Returns `false` once the list is
    /// exhausted, leaving no requested id selected.
    pub fn set_next_id(&self, ctx: &mut AffinityContext) -> bool {
        while let Some(raw) = ctx.candidates.pop_front() {
            match self.codec.decode(&raw) {
                Some(parsed) => {
                    trace!(
                        base_id = %parsed.base_id,
                        version = parsed.version,
                        "Selected incoming session id"
                    );
                    ctx.requested = Some(parsed);
                    return true;
                }
                None => debug!(raw = %raw, "Skipping malformed session id"),
            }
        }
        ctx.requested = None;
        false
    }

    /// The id/version the request is currently using: the outgoing id when a
    /// session is already bound, otherwise the incoming one.
    pub fn in_use_id(&self, ctx: &AffinityContext) -> Option<(String, u32)> {
        ctx.response
            .as_ref()
            .or(ctx.requested.as_ref())
            .map(|p| (p.base_id.clone(), p.version))
    }

    /// Merge `clone_token` into the request's clone chain and return the
    /// resulting chain. The result is stored as the outgoing chain.
    pub fn update_clone_chain(&self, ctx: &mut AffinityContext, clone_token: &str) -> String {
        let requested = ctx.requested.as_ref();
        let response = ctx.response.as_ref();

        let base_changed = matches!(
            (requested, response),
            (Some(req), Some(resp)) if req.base_id != resp.base_id
        );

        let starting = if base_changed {
            None
        } else {
            response
                .and_then(|r| r.clone_chain.as_deref())
                .or_else(|| requested.and_then(|r| r.clone_chain.as_deref()))
        };

        let mut tokens: Vec<String> = starting
            .map(|chain| {
                self.codec
                    .split_chain(chain)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if let Some(expected) = &self.expected_clone_ids
            && tokens.iter().any(|t| !expected.contains(t))
        {
            warn!(
                chain = %self.codec.join_chain(&tokens),
                "Discarding clone chain with unexpected clone ids"
            );
            tokens.clear();
        }

        match tokens.iter().position(|t| t == clone_token) {
            Some(0) => {}
            Some(pos) if self.no_switchback => {
                let token = tokens.remove(pos);
                tokens.insert(0, token);
            }
            Some(_) => {}
            None if self.no_switchback => tokens.insert(0, clone_token.to_string()),
            None => tokens.push(clone_token.to_string()),
        }

        let chain = self.codec.join_chain(&tokens);
        let (base_id, version) = match (response, requested) {
            (Some(p), _) | (None, Some(p)) => (p.base_id.clone(), p.version),
            (None, None) => (String::new(), 0),
        };
        ctx.response = Some(ParsedId::new(version, base_id, Some(chain.clone())));
        chain
    }

    /// Build the outgoing token for `session`.
    ///
    /// Returns `None` when the id or chain contains unsafe characters or the
    /// token would exceed the configured maximum length.
    pub fn encode_token(&self, ctx: &mut AffinityContext, session: &Session) -> Option<String> {
        let base_id = session.id();
        ctx.set_response(&base_id, session.version());

        let chain = match self.clone_id() {
            Some(clone) => Some(self.update_clone_chain(ctx, &clone)),
            None => ctx.response.as_ref().and_then(|r| r.clone_chain.clone()),
        };

        let encoded = self
            .codec
            .encode_checked(session.version(), &base_id, chain.as_deref());
        if encoded.is_none() {
            warn!(
                session_id = %base_id,
                "Refusing to encode unsafe or over-long session token"
            );
        }
        encoded
    }

    /// Add the session token to `url` as a path parameter.
    ///
    /// Any existing parameter of the same name is replaced. On failure the
    /// original URL is returned unchanged.
    pub fn encode_url(&self, url: &str, ctx: &mut AffinityContext, session: &Session) -> String {
        let Some(token) = self.encode_token(ctx, session) else {
            return url.to_string();
        };

        let split = url.find(['?', '#']).unwrap_or(url.len());
        let (path, rest) = url.split_at(split);
        let marker = format!(";{}=", self.url_parameter);
        let path = match path.find(&marker) {
            Some(idx) => &path[..idx],
            None => path,
        };
        format!("{path}{marker}{token}{rest}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "AbCdEfGhIjKlMnOpQrStUvW";
    const OTHER: &str = "ZyXwVuTsRqPoNmLkJiHgFeD";

    fn manager(config: SessionManagerConfig) -> AffinityManager {
        AffinityManager::new(&config)
    }

    fn ctx_with(raw: &str) -> (AffinityManager, AffinityContext) {
        let m = manager(SessionManagerConfig::default());
        let mut ctx = AffinityContext::new([raw]);
        assert!(m.set_next_id(&mut ctx));
        (m, ctx)
    }

    #[test]
    fn test_set_next_id_skips_malformed() {
        let m = manager(SessionManagerConfig::default());
        let mut ctx = AffinityContext::new([":bad", BASE, OTHER]);

        assert!(m.set_next_id(&mut ctx));
        assert_eq!(ctx.requested().unwrap().base_id, BASE);
        assert!(m.set_next_id(&mut ctx));
        assert_eq!(ctx.requested().unwrap().base_id, OTHER);
        assert!(!m.set_next_id(&mut ctx));
        assert!(ctx.requested().is_none());
    }

    #[test]
    fn test_in_use_prefers_response() {
        let (m, mut ctx) = ctx_with(&format!("0002{BASE}"));
        assert_eq!(m.in_use_id(&ctx), Some((BASE.to_string(), 2)));
        ctx.set_response(OTHER, 0);
        assert_eq!(m.in_use_id(&ctx), Some((OTHER.to_string(), 0)));
    }

    #[test]
    fn test_clone_appended_without_switchback() {
        let (m, mut ctx) = ctx_with(&format!("{BASE}:A:B"));
        assert_eq!(m.update_clone_chain(&mut ctx, "C"), "A:B:C");
    }

    #[test]
    fn test_switchback_moves_clone_to_front() {
        let m = manager(SessionManagerConfig::default().with_no_affinity_switchback(true));
        let mut ctx = AffinityContext::new([format!("{BASE}:A:B")]);
        m.set_next_id(&mut ctx);

        assert_eq!(m.update_clone_chain(&mut ctx, "C"), "C:A:B");
        assert_eq!(m.update_clone_chain(&mut ctx, "B"), "B:C:A");
    }

    #[test]
    fn test_present_clone_is_not_duplicated() {
        let (m, mut ctx) = ctx_with(&format!("{BASE}:A:B"));
        assert_eq!(m.update_clone_chain(&mut ctx, "A"), "A:B");
    }

    #[test]
    fn test_new_base_id_resets_chain() {
        let (m, mut ctx) = ctx_with(&format!("{BASE}:A:B"));
        ctx.set_response(OTHER, 0);
        assert_eq!(m.update_clone_chain(&mut ctx, "C"), "C");
    }

    #[test]
    fn test_unexpected_clone_discards_whole_chain() {
        let m = manager(SessionManagerConfig::default().with_expected_clone_ids(["X", "Y"]));
        let mut ctx = AffinityContext::new([format!("{BASE}:X:Z")]);
        m.set_next_id(&mut ctx);
        assert_eq!(m.update_clone_chain(&mut ctx, "Y"), "Y");
    }

    #[test]
    fn test_encode_token_and_url() {
        let m = manager(SessionManagerConfig::default().with_clone_id("C"));
        let mut ctx = AffinityContext::new([format!("{BASE}:A")]);
        m.set_next_id(&mut ctx);
        let session = Session::new(BASE, 0, "app", 0, 60, false);

        assert_eq!(
            m.encode_token(&mut ctx, &session).as_deref(),
            Some(format!("{BASE}:A:C").as_str())
        );
        assert_eq!(
            m.encode_url("/cart?item=1", &mut ctx, &session),
            format!("/cart;jsessionid={BASE}:A:C?item=1")
        );
        assert_eq!(
            m.encode_url("/cart;jsessionid=old#top", &mut ctx, &session),
            format!("/cart;jsessionid={BASE}:A:C#top")
        );
    }

    #[test]
    fn test_unsafe_chain_returns_original_url() {
        let m = manager(SessionManagerConfig::default().with_clone_id("C"));
        let mut ctx = AffinityContext::new([format!("{BASE}:A<b>")]);
        m.set_next_id(&mut ctx);
        let session = Session::new(BASE, 0, "app", 0, 60, false);

        assert!(m.encode_token(&mut ctx, &session).is_none());
        assert_eq!(m.encode_url("/cart?x=1", &mut ctx, &session), "/cart?x=1");
    }

    #[test]
    fn test_overlong_token_returns_original_url() {
        let m = manager(
            SessionManagerConfig::default()
                .with_clone_id("CLONE")
                .with_max_id_length(26),
        );
        let mut ctx = AffinityContext::default();
        let session = Session::new(BASE, 0, "app", 0, 60, false);
        assert_eq!(m.encode_url("/home", &mut ctx, &session), "/home");
    }

    #[test]
    fn test_encode_without_clone_id_keeps_no_chain() {
        let m = manager(SessionManagerConfig::default());
        let mut ctx = AffinityContext::default();
        let session = Session::new(BASE, 3, "app", 0, 60, false);
        assert_eq!(
            m.encode_token(&mut ctx, &session).as_deref(),
            Some(format!("0003{BASE}").as_str())
        );
    }
}
