//! Connection handshake for the direct backend.
//!
//! The accepting side speaks first with a fresh challenge. The dialing side
//! answers with a signed request naming both endpoints:
//!
//! ```text
//! challenge (16)                                                            <- responder
//! src_pk (32) | src_port (2, BE) | dst_pk (32) | dst_port (2, BE) | nonce (16) | sig (64)
//! status (1) | sig (64)                                                     <- responder
//! ```
//!
//! The request `sig` is the source key's signature over the request fields
//! followed by the challenge, so a recorded request is useless on any other
//! connection. The verdict is signed by the destination key over
//! `nonce | status`. A status other than [`Status::Ok`] ends the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use corelib::keys::{PUBLIC_KEY_LEN, SIGNATURE_LEN};
use corelib::{Addr, PublicKey, SecretKey};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BackendError;

pub(crate) const NONCE_LEN: usize = 16;
const SIGNED_LEN: usize = 2 * (PUBLIC_KEY_LEN + 2) + NONCE_LEN;
pub(crate) const REQUEST_LEN: usize = SIGNED_LEN + SIGNATURE_LEN;
pub(crate) const RESPONSE_LEN: usize = 1 + SIGNATURE_LEN;

pub(crate) type Nonce = [u8; NONCE_LEN];

pub(crate) fn fresh_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Responder verdict.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Status {
    Ok = 0,
    NoListener = 1,
    WrongKey = 2,
}

impl Status {
    fn from_u8(value: u8) -> Result<Self, BackendError> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::NoListener),
            2 => Ok(Status::WrongKey),
            other => Err(BackendError::Handshake(format!("unknown status {}", other))),
        }
    }
}

/// The opening message of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Request {
    pub src: Addr,
    pub dst: Addr,
    pub nonce: Nonce,
}

impl Request {
    pub fn new(src: Addr, dst: Addr) -> Self {
        Self {
            src,
            dst,
            nonce: fresh_nonce(),
        }
    }

    /// Encodes and signs the request, binding it to the responder's
    /// `challenge`.
    pub fn encode(&self, sk: &SecretKey, challenge: &Nonce) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_LEN + NONCE_LEN);
        buf.put_slice(self.src.pk.as_bytes());
        buf.put_u16(self.src.port);
        buf.put_slice(self.dst.pk.as_bytes());
        buf.put_u16(self.dst.port);
        buf.put_slice(&self.nonce);
        buf.put_slice(challenge);
        let sig = sk.sign(&buf);
        buf.truncate(SIGNED_LEN);
        buf.put_slice(&sig);
        buf.freeze()
    }

    /// Decodes a request and checks the source's signature over it and the
    /// `challenge` this side sent.
    pub fn decode(frame: &[u8; REQUEST_LEN], challenge: &Nonce) -> Result<Self, BackendError> {
        let (signed, sig) = frame.split_at(SIGNED_LEN);
        let mut buf = signed;

        let src_pk = read_pk(&mut buf)?;
        let src_port = buf.get_u16();
        let dst_pk = read_pk(&mut buf)?;
        let dst_port = buf.get_u16();
        let mut nonce = [0u8; NONCE_LEN];
        buf.copy_to_slice(&mut nonce);

        let mut message = Vec::with_capacity(SIGNED_LEN + NONCE_LEN);
        message.extend_from_slice(signed);
        message.extend_from_slice(challenge);
        src_pk.verify(&message, &to_sig(sig))?;

        Ok(Self {
            src: Addr::new(src_pk, src_port),
            dst: Addr::new(dst_pk, dst_port),
            nonce,
        })
    }
}

fn read_pk(buf: &mut &[u8]) -> Result<PublicKey, BackendError> {
    let mut bytes = [0u8; PUBLIC_KEY_LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(PublicKey::from_bytes(bytes)?)
}

fn to_sig(bytes: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut sig = [0u8; SIGNATURE_LEN];
    sig.copy_from_slice(bytes);
    sig
}

fn response_message(nonce: &Nonce, status: u8) -> [u8; NONCE_LEN + 1] {
    let mut msg = [0u8; NONCE_LEN + 1];
    msg[..NONCE_LEN].copy_from_slice(nonce);
    msg[NONCE_LEN] = status;
    msg
}

pub(crate) fn encode_response(nonce: &Nonce, status: Status, sk: &SecretKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESPONSE_LEN);
    buf.put_u8(status as u8);
    buf.put_slice(&sk.sign(&response_message(nonce, status as u8)));
    buf.freeze()
}

/// Checks the responder's signature and returns its verdict.
pub(crate) fn decode_response(
    frame: &[u8; RESPONSE_LEN],
    nonce: &Nonce,
    responder: &PublicKey,
) -> Result<Status, BackendError> {
    let status = frame[0];
    responder.verify(&response_message(nonce, status), &to_sig(&frame[1..]))?;
    Status::from_u8(status)
}

/// Dialing side. Returns once the responder accepted the connection.
pub(crate) async fn initiate<S>(
    stream: &mut S,
    sk: &SecretKey,
    src: Addr,
    dst: Addr,
) -> Result<(), BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; NONCE_LEN];
    stream.read_exact(&mut challenge).await?;

    let request = Request::new(src, dst);
    stream.write_all(&request.encode(sk, &challenge)).await?;
    stream.flush().await?;

    let mut frame = [0u8; RESPONSE_LEN];
    stream.read_exact(&mut frame).await?;

    match decode_response(&frame, &request.nonce, &dst.pk)? {
        Status::Ok => Ok(()),
        Status::NoListener => Err(BackendError::Unreachable {
            pk: dst.pk,
            port: dst.port,
        }),
        Status::WrongKey => Err(BackendError::Handshake(format!(
            "peer at the configured address is not {}",
            dst.pk
        ))),
    }
}

/// Accepting side, first half: challenges the dialer, then reads and
/// verifies its request.
pub(crate) async fn read_request<S>(stream: &mut S) -> Result<Request, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = fresh_nonce();
    stream.write_all(&challenge).await?;
    stream.flush().await?;

    let mut frame = [0u8; REQUEST_LEN];
    stream.read_exact(&mut frame).await?;
    Request::decode(&frame, &challenge)
}

/// Accepting side, second half: sends the verdict.
pub(crate) async fn write_response<S>(
    stream: &mut S,
    request: &Request,
    status: Status,
    sk: &SecretKey,
) -> Result<(), BackendError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&encode_response(&request.nonce, status, sk))
        .await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::KeyError;

    #[test]
    fn test_request_layout() {
        assert_eq!(REQUEST_LEN, 148);
        assert_eq!(RESPONSE_LEN, 65);
    }

    #[test]
    fn test_tampered_request_rejected() {
        let sk = SecretKey::generate();
        let dst = SecretKey::generate().public_key();
        let challenge = fresh_nonce();
        let req = Request::new(Addr::new(sk.public_key(), 50000), Addr::new(dst, 45));

        let mut frame = [0u8; REQUEST_LEN];
        frame.copy_from_slice(&req.encode(&sk, &challenge));
        assert_eq!(Request::decode(&frame, &challenge).unwrap(), req);

        // Redirect to another port without re-signing.
        frame[PUBLIC_KEY_LEN + 2 + PUBLIC_KEY_LEN + 1] ^= 0x01;
        assert!(matches!(
            Request::decode(&frame, &challenge),
            Err(BackendError::Key(KeyError::BadSignature))
        ));
    }

    #[test]
    fn test_request_bound_to_challenge() {
        let sk = SecretKey::generate();
        let dst = SecretKey::generate().public_key();
        let req = Request::new(Addr::new(sk.public_key(), 50000), Addr::new(dst, 45));

        let mut frame = [0u8; REQUEST_LEN];
        frame.copy_from_slice(&req.encode(&sk, &fresh_nonce()));
        assert!(matches!(
            Request::decode(&frame, &fresh_nonce()),
            Err(BackendError::Key(KeyError::BadSignature))
        ));
    }

    #[tokio::test]
    async fn test_recorded_request_replayed_on_new_stream() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let src = Addr::new(a.public_key(), 49999);
        let dst = Addr::new(b.public_key(), 45);

        // Record what a genuine dialer sends on its stream.
        let (mut left, mut right) = tokio::io::duplex(1024);
        let responder = tokio::spawn(async move {
            let req = read_request(&mut right).await.unwrap();
            write_response(&mut right, &req, Status::Ok, &b).await.unwrap();
        });
        let mut challenge = [0u8; NONCE_LEN];
        left.read_exact(&mut challenge).await.unwrap();
        let recorded = Request::new(src, dst).encode(&a, &challenge);
        left.write_all(&recorded).await.unwrap();
        let mut verdict = [0u8; RESPONSE_LEN];
        left.read_exact(&mut verdict).await.unwrap();
        responder.await.unwrap();

        // The same bytes on a fresh stream meet a fresh challenge.
        let (mut left, mut right) = tokio::io::duplex(1024);
        let responder = tokio::spawn(async move { read_request(&mut right).await });
        left.read_exact(&mut challenge).await.unwrap();
        left.write_all(&recorded).await.unwrap();
        assert!(matches!(
            responder.await.unwrap(),
            Err(BackendError::Key(KeyError::BadSignature))
        ));
    }

    #[test]
    fn test_response_signed_by_wrong_key_rejected() {
        let responder = SecretKey::generate();
        let impostor = SecretKey::generate();
        let nonce = fresh_nonce();

        let mut frame = [0u8; RESPONSE_LEN];
        frame.copy_from_slice(&encode_response(&nonce, Status::Ok, &impostor));
        assert!(decode_response(&frame, &nonce, &responder.public_key()).is_err());

        frame.copy_from_slice(&encode_response(&nonce, Status::NoListener, &responder));
        assert_eq!(
            decode_response(&frame, &nonce, &responder.public_key()).unwrap(),
            Status::NoListener
        );
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let src = Addr::new(a.public_key(), 49999);
        let dst = Addr::new(b.public_key(), 36);

        let (mut left, mut right) = tokio::io::duplex(1024);
        let responder = tokio::spawn(async move {
            let req = read_request(&mut right).await.unwrap();
            write_response(&mut right, &req, Status::Ok, &b).await.unwrap();
            req
        });

        initiate(&mut left, &a, src, dst).await.unwrap();
        let req = responder.await.unwrap();
        assert_eq!(req.src, src);
        assert_eq!(req.dst, dst);
    }
}
