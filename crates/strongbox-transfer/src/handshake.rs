/// Registration, reconnect and session key bootstrap.
///
/// ```text
/// Unregistered ──REGISTER──▶ AwaitingRegistration ──REGISTER_OK──▶ HaveIdentity
/// HaveIdentity ──SEND_PUBLIC_KEY──▶ AwaitingSessionKey ──PUBLIC_KEY_ACK──▶ Ready
/// HaveIdentity ──RECONNECT──▶ AwaitingReconnect ──RECONNECT_ACK──▶ Ready
/// ```
///
/// Nothing here retries. A rejected reconnect is reported as
/// [`TransferError::Authentication`]; [`Handshake::establish`] is the one
/// caller-level policy that falls back to a fresh registration.

use strongbox_crypto::{AsymmetricCipher, ClientKeypair, SessionKey};
use strongbox_types::events::{Phase, StatusEvent};
use strongbox_types::models::ClientId;
use tracing::{debug, info, warn};

use crate::config::TransferContext;
use crate::connection::RequestChannel;
use crate::error::{ProtocolError, Result, TransferError};
use crate::identity::{ClientIdentity, IdentityStore};
use crate::protocol::{
    NamePayload, PublicKeyPayload, Request, RequestCode, Response, ResponseCode, SessionKeyGrant,
    decode_client_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unregistered,
    AwaitingRegistration,
    HaveIdentity,
    AwaitingSessionKey,
    AwaitingReconnect,
    Ready,
}

/// Drives one handshake over a connected channel.
pub struct Handshake<'a> {
    ctx: &'a TransferContext,
    state: HandshakeState,
    history: Vec<HandshakeState>,
}

impl<'a> Handshake<'a> {
    pub fn new(ctx: &'a TransferContext) -> Self {
        Self {
            ctx,
            state: HandshakeState::Unregistered,
            history: vec![HandshakeState::Unregistered],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Every state visited, in order.
    pub fn history(&self) -> &[HandshakeState] {
        &self.history
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "handshake transition");
        self.state = next;
        self.history.push(next);
    }

    fn expect_state(&self, allowed: HandshakeState, op: &str) -> Result<()> {
        if self.state != allowed {
            return Err(TransferError::Config(format!(
                "{} requires handshake state {:?}, currently {:?}",
                op, allowed, self.state
            )));
        }
        Ok(())
    }

    /// Mark a previously persisted identity as loaded.
    pub fn adopt_identity(&mut self) -> Result<()> {
        self.expect_state(HandshakeState::Unregistered, "adopting an identity")?;
        self.transition(HandshakeState::HaveIdentity);
        Ok(())
    }

    /// Start over from scratch after a rejected reconnect.
    pub fn reset(&mut self) {
        self.transition(HandshakeState::Unregistered);
    }

    /// REGISTER: send the username, receive a server-allocated client id.
    pub fn register<C: RequestChannel + ?Sized>(&mut self, chan: &mut C, username: &str) -> Result<ClientId> {
        self.expect_state(HandshakeState::Unregistered, "register")?;
        let payload = NamePayload {
            name: username.to_string(),
        }
        .encode()?;

        self.transition(HandshakeState::AwaitingRegistration);
        let response = chan.exchange(&Request::new(RequestCode::Register, ClientId::nil(), payload))?;

        match response.code {
            ResponseCode::RegisterOk => {
                let id = decode_client_id(&response.payload)?;
                self.transition(HandshakeState::HaveIdentity);
                info!(client_id = %id, username, "registered");
                Ok(id)
            }
            ResponseCode::RegisterFail | ResponseCode::GenericServerError => Err(
                TransferError::Authentication(format!("registration of {:?} rejected", username)),
            ),
            other => Err(unexpected("REGISTER_OK", other)),
        }
    }

    /// SEND_PUBLIC_KEY: submit the DER key, unwrap the returned session key.
    pub fn submit_public_key<C: RequestChannel + ?Sized>(
        &mut self,
        chan: &mut C,
        client_id: ClientId,
        username: &str,
        cipher: &dyn AsymmetricCipher,
    ) -> Result<SessionKey> {
        self.expect_state(HandshakeState::HaveIdentity, "public key submission")?;
        let payload = PublicKeyPayload {
            name: username.to_string(),
            public_key: cipher.public_key_der().to_vec(),
        }
        .encode()?;

        self.transition(HandshakeState::AwaitingSessionKey);
        let response = chan.exchange(&Request::new(RequestCode::SendPublicKey, client_id, payload))?;

        match response.code {
            ResponseCode::PublicKeyAck => self.accept_grant(&response, client_id, cipher),
            ResponseCode::GenericServerError => Err(TransferError::Authentication(
                "server refused public key".into(),
            )),
            other => Err(unexpected("PUBLIC_KEY_ACK", other)),
        }
    }

    /// RECONNECT: resend the existing id and name; no new keypair needed.
    pub fn reconnect<C: RequestChannel + ?Sized>(
        &mut self,
        chan: &mut C,
        client_id: ClientId,
        username: &str,
        cipher: &dyn AsymmetricCipher,
    ) -> Result<SessionKey> {
        self.expect_state(HandshakeState::HaveIdentity, "reconnect")?;
        let payload = NamePayload {
            name: username.to_string(),
        }
        .encode()?;

        self.transition(HandshakeState::AwaitingReconnect);
        let response = chan.exchange(&Request::new(RequestCode::Reconnect, client_id, payload))?;

        match response.code {
            ResponseCode::ReconnectAck => self.accept_grant(&response, client_id, cipher),
            ResponseCode::ReconnectFail | ResponseCode::GenericServerError => Err(
                TransferError::Authentication(format!("reconnect of {} rejected", client_id)),
            ),
            other => Err(unexpected("RECONNECT_ACK", other)),
        }
    }

    fn accept_grant(
        &mut self,
        response: &Response,
        client_id: ClientId,
        cipher: &dyn AsymmetricCipher,
    ) -> Result<SessionKey> {
        let grant = SessionKeyGrant::decode(&response.payload)?;
        if grant.client_id != client_id {
            return Err(ProtocolError::BadPayload(format!(
                "session key issued for {} but we are {}",
                grant.client_id, client_id
            ))
            .into());
        }
        let key = cipher.decrypt_session_key(&grant.encrypted_key)?;
        self.transition(HandshakeState::Ready);
        debug!(client_id = %client_id, "session key installed");
        Ok(key)
    }

    /// Bring a fresh connection to `Ready`.
    ///
    /// Prefers reconnecting with `known` (or whatever `store` holds for this
    /// username). If the server rejects the reconnect, registers from
    /// scratch with a new keypair and persists the result.
    pub fn establish<C: RequestChannel + ?Sized>(
        &mut self,
        chan: &mut C,
        store: &dyn IdentityStore,
        username: &str,
        known: Option<ClientIdentity>,
    ) -> Result<(ClientIdentity, SessionKey)> {
        let known = match known {
            Some(id) => Some(id),
            None => store.load()?,
        }
        .filter(|id| {
            let same = id.username == username;
            if !same {
                warn!(stored = %id.username, username, "stored identity is for another user, ignoring");
            }
            same
        });

        if let Some(identity) = known {
            self.ctx.emit(StatusEvent::Phase(Phase::Reconnecting));
            self.adopt_identity()?;
            match self.reconnect(chan, identity.client_id, username, &identity.cipher()) {
                Ok(key) => {
                    self.ctx
                        .emit(StatusEvent::operation("reconnect", true, identity.client_id.to_hex()));
                    return Ok((identity, key));
                }
                Err(TransferError::Authentication(reason)) => {
                    warn!(%reason, "reconnect rejected, registering again");
                    self.ctx.emit(StatusEvent::operation("reconnect", false, reason));
                    self.reset();
                }
                Err(e) => return Err(e),
            }
        }

        self.ctx.emit(StatusEvent::Phase(Phase::Registering));
        let client_id = self.register(chan, username)?;
        let identity = ClientIdentity {
            client_id,
            username: username.to_string(),
            keypair: ClientKeypair::generate()?,
        };
        debug!(fingerprint = %identity.keypair.fingerprint(), "generated client keypair");
        store.save(&identity)?;
        self.ctx
            .emit(StatusEvent::operation("register", true, client_id.to_hex()));

        self.ctx.emit(StatusEvent::Phase(Phase::ExchangingKeys));
        let key = self.submit_public_key(chan, client_id, username, &identity.cipher())?;
        self.ctx.emit(StatusEvent::operation("key_exchange", true, ""));
        Ok((identity, key))
    }
}

fn unexpected(expected: &'static str, got: ResponseCode) -> TransferError {
    ProtocolError::UnexpectedResponse {
        expected,
        got: got as u16,
    }
    .into()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use strongbox_crypto::{CryptoError, RsaOaepCipher, wrap_session_key};

    use super::*;
    use crate::config::TransferConfig;
    use crate::identity::MemoryIdentityStore;
    use crate::status::NullSink;

    /// Channel that records requests and replays canned responses.
    #[derive(Default)]
    pub struct ScriptedChannel {
        pub sent: Vec<Request>,
        pub replies: VecDeque<Result<Response>>,
    }

    impl ScriptedChannel {
        pub fn reply(mut self, r: Response) -> Self {
            self.replies.push_back(Ok(r));
            self
        }
    }

    impl RequestChannel for ScriptedChannel {
        fn send_request(&mut self, request: &Request) -> Result<()> {
            self.sent.push(request.clone());
            Ok(())
        }

        fn receive_response(&mut self) -> Result<Response> {
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(TransferError::Network("script exhausted".into())))
        }
    }

    /// Test-only cipher whose decryption always fails.
    struct BrokenCipher(Vec<u8>);

    impl AsymmetricCipher for BrokenCipher {
        fn public_key_der(&self) -> &[u8] {
            &self.0
        }

        fn decrypt_session_key(&self, _ciphertext: &[u8]) -> std::result::Result<SessionKey, CryptoError> {
            Err(CryptoError::KeyDecryption("stub".into()))
        }
    }

    fn ctx() -> TransferContext {
        TransferContext::new(
            TransferConfig {
                username: "alice".into(),
                ..Default::default()
            },
            Arc::new(NullSink),
        )
    }

    fn id() -> ClientId {
        ClientId::from_bytes([0x11; 16])
    }

    fn grant(code: ResponseCode, client_id: ClientId, der: &[u8], key: &SessionKey) -> Response {
        let encrypted_key = wrap_session_key(der, key).unwrap();
        Response::new(code, SessionKeyGrant { client_id, encrypted_key }.encode())
    }

    #[test]
    fn alice_registers_and_gets_session_key() {
        let ctx = ctx();
        let cipher = RsaOaepCipher::new(ClientKeypair::generate().unwrap());
        let server_key = SessionKey::from_bytes([0xA5; 32]);
        let mut chan = ScriptedChannel::default()
            .reply(Response::new(ResponseCode::RegisterOk, id().as_bytes().to_vec()))
            .reply(grant(ResponseCode::PublicKeyAck, id(), cipher.public_key_der(), &server_key));

        let mut hs = Handshake::new(&ctx);
        let client_id = hs.register(&mut chan, "alice").unwrap();
        assert_eq!(client_id.as_bytes().len(), 16);
        let key = hs.submit_public_key(&mut chan, client_id, "alice", &cipher).unwrap();

        assert_eq!(key.as_bytes(), server_key.as_bytes());
        assert_eq!(hs.state(), HandshakeState::Ready);
        assert_eq!(
            hs.history(),
            &[
                HandshakeState::Unregistered,
                HandshakeState::AwaitingRegistration,
                HandshakeState::HaveIdentity,
                HandshakeState::AwaitingSessionKey,
                HandshakeState::Ready,
            ]
        );

        assert_eq!(chan.sent[0].code, RequestCode::Register);
        assert!(chan.sent[0].client_id.is_nil());
        assert_eq!(NamePayload::decode(&chan.sent[0].payload).unwrap().name, "alice");
        let pk = PublicKeyPayload::decode(&chan.sent[1].payload).unwrap();
        assert_eq!(pk.public_key, cipher.public_key_der());
        assert_eq!(chan.sent[1].client_id, client_id);
    }

    #[test]
    fn registration_rejected_is_authentication_error() {
        let ctx = ctx();
        let mut chan = ScriptedChannel::default().reply(Response::new(ResponseCode::RegisterFail, Vec::new()));
        let err = Handshake::new(&ctx).register(&mut chan, "alice").unwrap_err();
        assert!(matches!(err, TransferError::Authentication(_)));
    }

    #[test]
    fn malformed_client_id_is_protocol_error() {
        let ctx = ctx();
        let mut chan = ScriptedChannel::default().reply(Response::new(ResponseCode::RegisterOk, vec![1u8; 5]));
        let err = Handshake::new(&ctx).register(&mut chan, "alice").unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn decryption_failure_is_crypto_error() {
        let ctx = ctx();
        let broken = BrokenCipher(vec![0x30; strongbox_crypto::PUBLIC_KEY_SIZE]);
        let mut chan = ScriptedChannel::default().reply(Response::new(
            ResponseCode::PublicKeyAck,
            SessionKeyGrant {
                client_id: id(),
                encrypted_key: vec![0u8; 128],
            }
            .encode(),
        ));
        let mut hs = Handshake::new(&ctx);
        hs.adopt_identity().unwrap();
        let err = hs.submit_public_key(&mut chan, id(), "alice", &broken).unwrap_err();
        assert!(matches!(err, TransferError::Crypto(_)));
        assert_eq!(hs.state(), HandshakeState::AwaitingSessionKey);
    }

    #[test]
    fn grant_for_other_client_rejected() {
        let ctx = ctx();
        let cipher = RsaOaepCipher::new(ClientKeypair::generate().unwrap());
        let other = ClientId::from_bytes([0x22; 16]);
        let mut chan = ScriptedChannel::default().reply(grant(
            ResponseCode::ReconnectAck,
            other,
            cipher.public_key_der(),
            &SessionKey::from_bytes([1; 32]),
        ));
        let mut hs = Handshake::new(&ctx);
        hs.adopt_identity().unwrap();
        let err = hs.reconnect(&mut chan, id(), "alice", &cipher).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(ProtocolError::BadPayload(_))));
    }

    #[test]
    fn reconnect_with_persisted_identity_skips_registration() {
        let ctx = ctx();
        let identity = ClientIdentity {
            client_id: id(),
            username: "alice".into(),
            keypair: ClientKeypair::generate().unwrap(),
        };
        let store = MemoryIdentityStore::with(identity.clone());
        let fresh = SessionKey::from_bytes([0x3C; 32]);
        let mut chan = ScriptedChannel::default().reply(grant(
            ResponseCode::ReconnectAck,
            id(),
            identity.keypair.public_key_der(),
            &fresh,
        ));

        let mut hs = Handshake::new(&ctx);
        let (got, key) = hs.establish(&mut chan, &store, "alice", None).unwrap();
        assert_eq!(got.client_id, id());
        assert_eq!(key.as_bytes(), fresh.as_bytes());
        assert_eq!(chan.sent.len(), 1);
        assert_eq!(chan.sent[0].code, RequestCode::Reconnect);
        assert_eq!(
            hs.history(),
            &[
                HandshakeState::Unregistered,
                HandshakeState::HaveIdentity,
                HandshakeState::AwaitingReconnect,
                HandshakeState::Ready,
            ]
        );
    }

    #[test]
    fn rejected_reconnect_falls_back_to_registration() {
        let ctx = ctx();
        let old = ClientIdentity {
            client_id: id(),
            username: "alice".into(),
            keypair: ClientKeypair::generate().unwrap(),
        };
        let store = MemoryIdentityStore::with(old.clone());
        let new_id = ClientId::from_bytes([0x77; 16]);
        let mut chan = ScriptedChannel::default()
            .reply(Response::new(ResponseCode::ReconnectFail, id().as_bytes().to_vec()))
            .reply(Response::new(ResponseCode::RegisterOk, new_id.as_bytes().to_vec()));

        let mut hs = Handshake::new(&ctx);
        // The key grant for the new keypair can only be built once we know
        // it, so the script stops after REGISTER_OK and the exchange fails.
        let err = hs.establish(&mut chan, &store, "alice", None).unwrap_err();
        assert!(err.is_network());

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.client_id, new_id);
        assert_ne!(saved.keypair.public_key_der(), old.keypair.public_key_der());
        let codes: Vec<_> = chan.sent.iter().map(|r| r.code).collect();
        assert_eq!(
            codes,
            vec![RequestCode::Reconnect, RequestCode::Register, RequestCode::SendPublicKey]
        );
        assert!(hs.history().contains(&HandshakeState::Unregistered));
    }

    #[test]
    fn out_of_order_operation_refused() {
        let ctx = ctx();
        let cipher = RsaOaepCipher::new(ClientKeypair::generate().unwrap());
        let mut chan = ScriptedChannel::default();
        let mut hs = Handshake::new(&ctx);
        assert!(matches!(
            hs.submit_public_key(&mut chan, id(), "alice", &cipher),
            Err(TransferError::Config(_))
        ));
        assert!(chan.sent.is_empty());
    }
}
