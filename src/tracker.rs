use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::magnet::InfoHash;
use crate::messages::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, CodecError, ConnectRequest,
    ConnectResponse, Reply, ScrapeRequest, ScrapeResponse, Transaction,
};
use crate::transport::{MAX_DATAGRAM, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Querying,
    Completed,
    Failed,
}

/// Why the connect step failed, when it was not a transaction mismatch.
#[derive(Error, Debug)]
pub enum ConnectFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connect handshake failed: {0}")]
    ConnectFailed(#[source] ConnectFailure),
    #[error("Transaction ID mismatch: sent {sent:#010x}, received {received:#010x}")]
    TransactionMismatch { sent: u32, received: u32 },
    #[error("Tracker returned an error: {0}")]
    TrackerReportedError(String),
    #[error("Tracker exchange was cancelled")]
    Cancelled,
    #[error("Transport failure: {0}")]
    Transport(#[source] TransportError),
    #[error("Malformed tracker response: {0}")]
    Codec(#[from] CodecError),
    #[error("Session is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("Session has already failed")]
    Terminated,
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => SessionError::Cancelled,
            other => SessionError::Transport(other),
        }
    }
}

/// The client-controlled part of an announce. Connection and transaction IDs
/// are filled in by the session.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub key: u32,
    pub num_want: i32,
    pub port: u16,
}

/// Drives one tracker through connect followed by a single announce or scrape.
///
/// Every outbound request gets a fresh transaction ID drawn from `rng`, so replies
/// left over from an earlier step on the same socket are detected. Any error moves
/// the session to [`SessionState::Failed`], after which every call returns
/// [`SessionError::Terminated`].
pub struct TrackerSession<R> {
    rng: R,
    state: SessionState,
    connection_id: Option<u64>,
    timeout: Duration,
}

impl<R: RngCore> TrackerSession<R> {
    pub fn new(rng: R, timeout: Duration) -> Self {
        Self {
            rng,
            state: SessionState::Idle,
            connection_id: None,
            timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    /// Performs the connect handshake and returns the tracker-issued connection ID.
    pub fn connect<T: Transport>(&mut self, transport: &mut T) -> Result<u64, SessionError> {
        self.enter(SessionState::Idle, SessionState::Connecting)?;

        let result = self.exchange_connect(transport);
        match result {
            Ok(connection_id) => {
                info!("Connected to tracker, connection_id={connection_id:#018x}");
                self.connection_id = Some(connection_id);
                self.state = SessionState::Connected;
                Ok(connection_id)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn exchange_connect<T: Transport>(&mut self, transport: &mut T) -> Result<u64, SessionError> {
        let transaction_id = self.rng.next_u32();
        let request = ConnectRequest { transaction_id }.encode();
        debug!("Sending connect request, transaction_id={transaction_id:#010x}");

        let response = transport
            .send(&request)
            .and_then(|()| transport.receive(MAX_DATAGRAM, self.timeout))
            .map_err(connect_transport_error)?;
        let response = ConnectResponse::decode(&response)
            .map_err(|e| SessionError::ConnectFailed(e.into()))?;

        check_transaction(transaction_id, response.transaction_id)?;
        Ok(response.connection_id)
    }

    /// Requests seeder, completed and leecher counts for one torrent.
    pub fn scrape<T: Transport>(
        &mut self,
        transport: &mut T,
        info_hash: InfoHash,
    ) -> Result<ScrapeResponse, SessionError> {
        let connection_id = self.begin_query()?;
        let transaction_id = self.rng.next_u32();
        let request = ScrapeRequest {
            connection_id,
            transaction_id,
            info_hash: *info_hash.as_bytes(),
        };
        debug!("Sending scrape request for {info_hash}, transaction_id={transaction_id:#010x}");

        let result = self.query(
            transport,
            &request.encode(),
            transaction_id,
            ScrapeResponse::decode,
        );
        self.finish(result)
    }

    /// Registers as a peer and returns the tracker's peer list.
    pub fn announce<T: Transport>(
        &mut self,
        transport: &mut T,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse, SessionError> {
        let connection_id = self.begin_query()?;
        let transaction_id = self.rng.next_u32();
        let request = AnnounceRequest {
            connection_id,
            transaction_id,
            info_hash: *params.info_hash.as_bytes(),
            peer_id: params.peer_id,
            downloaded: params.downloaded,
            left: params.left,
            uploaded: params.uploaded,
            event: params.event,
            ip_address: 0,
            key: params.key,
            num_want: params.num_want,
            port: params.port,
        };
        debug!(
            "Sending announce request for {}, transaction_id={transaction_id:#010x}",
            params.info_hash
        );

        let result = self.query(
            transport,
            &request.encode(),
            transaction_id,
            AnnounceResponse::decode,
        );
        self.finish(result)
    }

    fn query<T: Transport, M: Transaction>(
        &mut self,
        transport: &mut T,
        request: &[u8],
        transaction_id: u32,
        decode: fn(&[u8]) -> Result<Reply<M>, CodecError>,
    ) -> Result<M, SessionError> {
        transport.send(request)?;
        let response = transport.receive(MAX_DATAGRAM, self.timeout)?;
        let reply = decode(&response)?;
        check_transaction(transaction_id, reply.transaction_id())?;

        match reply {
            Reply::Success(message) => Ok(message),
            Reply::Error(err) => {
                warn!("Tracker reported error: {}", err.message);
                Err(SessionError::TrackerReportedError(err.message))
            }
        }
    }

    fn begin_query(&mut self) -> Result<u64, SessionError> {
        let connection_id = match (self.state, self.connection_id) {
            (SessionState::Failed, _) => return Err(SessionError::Terminated),
            (SessionState::Connected, Some(connection_id)) => connection_id,
            (actual, _) => {
                return Err(SessionError::InvalidState {
                    expected: SessionState::Connected,
                    actual,
                });
            }
        };
        self.state = SessionState::Querying;
        Ok(connection_id)
    }

    fn finish<M>(&mut self, result: Result<M, SessionError>) -> Result<M, SessionError> {
        match result {
            Ok(message) => {
                self.state = SessionState::Completed;
                Ok(message)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn enter(&mut self, expected: SessionState, next: SessionState) -> Result<(), SessionError> {
        match self.state {
            SessionState::Failed => Err(SessionError::Terminated),
            actual if actual != expected => Err(SessionError::InvalidState { expected, actual }),
            _ => {
                self.state = next;
                Ok(())
            }
        }
    }

    fn fail(&mut self, e: SessionError) -> SessionError {
        warn!("Tracker session failed in {:?}: {e}", self.state);
        self.state = SessionState::Failed;
        self.connection_id = None;
        e
    }
}

fn connect_transport_error(e: TransportError) -> SessionError {
    match e {
        TransportError::Cancelled => SessionError::Cancelled,
        other => SessionError::ConnectFailed(other.into()),
    }
}

fn check_transaction(sent: u32, received: u32) -> Result<(), SessionError> {
    if sent != received {
        return Err(SessionError::TransactionMismatch { sent, received });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use byteorder::{BigEndian, ByteOrder};
    use rand::rngs::mock::StepRng;

    use super::*;
    use crate::messages::{Action, ErrorResponse};

    const CONNECTION_ID: u64 = 0xC0FFEE_0000_0001;
    const FIRST_TID: u32 = 0x1000;

    /// In-memory tracker that answers each request with `respond(request)`.
    struct FakeTracker<F> {
        respond: F,
        requests: Vec<Vec<u8>>,
    }

    impl<F> FakeTracker<F>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, TransportError>,
    {
        fn new(respond: F) -> Self {
            Self {
                respond,
                requests: Vec::new(),
            }
        }
    }

    impl<F> Transport for FakeTracker<F>
    where
        F: FnMut(&[u8]) -> Result<Vec<u8>, TransportError>,
    {
        fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.requests.push(bytes.to_vec());
            Ok(())
        }

        fn receive(
            &mut self,
            max_bytes: usize,
            _timeout: Duration,
        ) -> Result<Vec<u8>, TransportError> {
            let request = self.requests.last().cloned().unwrap_or_default();
            let mut response = (self.respond)(&request)?;
            response.truncate(max_bytes);
            Ok(response)
        }
    }

    fn action_of(request: &[u8]) -> u32 {
        BigEndian::read_u32(&request[8..12])
    }

    fn tid_of(request: &[u8]) -> u32 {
        BigEndian::read_u32(&request[12..16])
    }

    fn connect_reply(request: &[u8]) -> Vec<u8> {
        ConnectResponse {
            transaction_id: tid_of(request),
            connection_id: CONNECTION_ID,
        }
        .encode()
    }

    /// A well-behaved tracker that answers connect, scrape and announce.
    fn honest_tracker(request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let transaction_id = tid_of(request);
        let response = match action_of(request) {
            0 => connect_reply(request),
            1 => AnnounceResponse {
                transaction_id,
                interval: 1800,
                leechers: 3,
                seeders: 12,
                peers: vec![SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 51413)],
            }
            .encode(),
            2 => ScrapeResponse {
                transaction_id,
                seeders: 12,
                completed: 340,
                leechers: 3,
            }
            .encode(),
            other => panic!("unexpected action {other}"),
        };
        Ok(response)
    }

    fn session() -> TrackerSession<StepRng> {
        TrackerSession::new(StepRng::new(FIRST_TID as u64, 1), Duration::from_secs(1))
    }

    fn info_hash() -> InfoHash {
        InfoHash::new([0xAB; 20])
    }

    fn announce_params() -> AnnounceParams {
        AnnounceParams {
            info_hash: info_hash(),
            peer_id: *b"-TP0001-000000000000",
            downloaded: 0,
            left: 1024,
            uploaded: 0,
            event: AnnounceEvent::Started,
            key: 42,
            num_want: -1,
            port: 6881,
        }
    }

    #[test]
    fn test_connect_then_scrape() {
        let mut tracker = FakeTracker::new(honest_tracker);
        let mut session = session();
        assert_eq!(session.state(), SessionState::Idle);

        let connection_id = session.connect(&mut tracker).unwrap();
        assert_eq!(connection_id, CONNECTION_ID);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.connection_id(), Some(CONNECTION_ID));

        let stats = session.scrape(&mut tracker, info_hash()).unwrap();
        assert_eq!((stats.seeders, stats.completed, stats.leechers), (12, 340, 3));
        assert_eq!(session.state(), SessionState::Completed);

        let [connect, scrape] = &tracker.requests[..] else {
            panic!("expected two requests, got {}", tracker.requests.len());
        };
        assert_eq!(connect, &ConnectRequest { transaction_id: FIRST_TID }.encode());
        assert_eq!(scrape.len(), 36);
        assert_eq!(BigEndian::read_u64(&scrape[0..8]), CONNECTION_ID);
        assert_eq!(action_of(scrape), Action::Scrape.code());
        assert_eq!(tid_of(scrape), FIRST_TID + 1);
        assert_eq!(&scrape[16..36], info_hash().as_bytes());
    }

    #[test]
    fn test_connect_then_announce() {
        let mut tracker = FakeTracker::new(honest_tracker);
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        let response = session.announce(&mut tracker, &announce_params()).unwrap();

        assert_eq!(response.interval, 1800);
        assert_eq!(response.seeders, 12);
        assert_eq!(response.leechers, 3);
        assert_eq!(
            response.peers,
            vec![SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 51413)]
        );

        let announce = &tracker.requests[1];
        assert_eq!(announce.len(), 98);
        assert_eq!(BigEndian::read_u64(&announce[0..8]), CONNECTION_ID);
        assert_eq!(&announce[36..56], b"-TP0001-000000000000");
        assert_eq!(BigEndian::read_u64(&announce[64..72]), 1024);
        assert_eq!(BigEndian::read_u32(&announce[80..84]), 2);
        assert_eq!(BigEndian::read_u32(&announce[88..92]), 42);
        assert_eq!(BigEndian::read_i32(&announce[92..96]), -1);
        assert_eq!(BigEndian::read_u16(&announce[96..98]), 6881);
    }

    #[test]
    fn test_connect_transaction_mismatch() {
        let mut tracker = FakeTracker::new(|request: &[u8]| {
            Ok(ConnectResponse {
                transaction_id: tid_of(request) ^ 0xFFFF,
                connection_id: CONNECTION_ID,
            }
            .encode())
        });
        let mut session = session();

        let err = session.connect(&mut tracker).unwrap_err();
        assert!(matches!(
            err,
            SessionError::TransactionMismatch { sent, received }
                if sent == FIRST_TID && received == FIRST_TID ^ 0xFFFF
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.connection_id(), None);
    }

    #[test]
    fn test_failed_session_rejects_further_calls() {
        let mut tracker =
            FakeTracker::new(|_: &[u8]| Err(TransportError::Timeout(Duration::from_secs(1))));
        let mut session = session();

        assert!(session.connect(&mut tracker).is_err());
        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::Terminated)
        ));
        assert!(matches!(
            session.connect(&mut tracker),
            Err(SessionError::Terminated)
        ));
    }

    #[test]
    fn test_connect_transport_error() {
        let mut tracker = FakeTracker::new(|_: &[u8]| Err(TransportError::EmptyDatagram));
        let mut session = session();

        assert!(matches!(
            session.connect(&mut tracker),
            Err(SessionError::ConnectFailed(ConnectFailure::Transport(
                TransportError::EmptyDatagram
            )))
        ));
    }

    #[test]
    fn test_connect_wrong_action() {
        let mut tracker = FakeTracker::new(|request: &[u8]| {
            let mut response = connect_reply(request);
            response[3] = Action::Announce.code() as u8;
            Ok(response)
        });
        let mut session = session();

        assert!(matches!(
            session.connect(&mut tracker),
            Err(SessionError::ConnectFailed(ConnectFailure::Codec(
                CodecError::UnexpectedAction {
                    expected: 0,
                    actual: 1
                }
            )))
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_connect_error_reply() {
        let mut tracker = FakeTracker::new(|request: &[u8]| {
            Ok(ErrorResponse {
                transaction_id: tid_of(request),
                message: "denied!!".to_string(),
            }
            .encode())
        });
        let mut session = session();

        assert!(matches!(
            session.connect(&mut tracker),
            Err(SessionError::ConnectFailed(ConnectFailure::Codec(
                CodecError::UnexpectedAction {
                    expected: 0,
                    actual: 3
                }
            )))
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.connection_id(), None);
    }

    #[test]
    fn test_connect_cancelled() {
        let mut tracker = FakeTracker::new(|_: &[u8]| Err(TransportError::Cancelled));
        let mut session = session();

        assert!(matches!(
            session.connect(&mut tracker),
            Err(SessionError::Cancelled)
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_scrape_requires_connect() {
        let mut tracker = FakeTracker::new(honest_tracker);
        let mut session = session();

        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::InvalidState {
                expected: SessionState::Connected,
                actual: SessionState::Idle
            })
        ));
        assert!(tracker.requests.is_empty());
    }

    #[test]
    fn test_query_without_connection_id_keeps_state() {
        let mut tracker = FakeTracker::new(honest_tracker);
        let mut session = session();
        session.state = SessionState::Connected;

        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::InvalidState {
                expected: SessionState::Connected,
                actual: SessionState::Connected
            })
        ));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(tracker.requests.is_empty());
    }

    #[test]
    fn test_second_query_after_completion_is_rejected() {
        let mut tracker = FakeTracker::new(honest_tracker);
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        session.scrape(&mut tracker, info_hash()).unwrap();
        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::InvalidState {
                actual: SessionState::Completed,
                ..
            })
        ));
    }

    #[test]
    fn test_scrape_tracker_error() {
        let mut tracker = FakeTracker::new(|request: &[u8]| match action_of(request) {
            0 => Ok(connect_reply(request)),
            _ => Ok(ErrorResponse {
                transaction_id: tid_of(request),
                message: "unregistered torrent".to_string(),
            }
            .encode()),
        });
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::TrackerReportedError(message)) if message == "unregistered torrent"
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_scrape_stale_transaction() {
        let mut tracker = FakeTracker::new(|request: &[u8]| match action_of(request) {
            0 => Ok(connect_reply(request)),
            _ => Ok(ScrapeResponse {
                transaction_id: FIRST_TID,
                seeders: 1,
                completed: 1,
                leechers: 1,
            }
            .encode()),
        });
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::TransactionMismatch { sent, received })
                if sent == FIRST_TID + 1 && received == FIRST_TID
        ));
    }

    #[test]
    fn test_scrape_short_response() {
        let mut tracker = FakeTracker::new(|request: &[u8]| match action_of(request) {
            0 => Ok(connect_reply(request)),
            _ => Ok(vec![0, 0, 0, 2]),
        });
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        assert!(matches!(
            session.scrape(&mut tracker, info_hash()),
            Err(SessionError::Codec(CodecError::ShortBuffer { .. }))
        ));
    }

    #[test]
    fn test_announce_tracker_error() {
        let mut tracker = FakeTracker::new(|request: &[u8]| match action_of(request) {
            0 => Ok(connect_reply(request)),
            _ => Ok(ErrorResponse {
                transaction_id: tid_of(request),
                message: "torrent not allowed".to_string(),
            }
            .encode()),
        });
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        assert!(matches!(
            session.announce(&mut tracker, &announce_params()),
            Err(SessionError::TrackerReportedError(message)) if message == "torrent not allowed"
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_announce_stale_transaction() {
        let mut tracker = FakeTracker::new(|request: &[u8]| match action_of(request) {
            0 => Ok(connect_reply(request)),
            _ => Ok(AnnounceResponse {
                transaction_id: FIRST_TID,
                interval: 900,
                leechers: 0,
                seeders: 1,
                peers: Vec::new(),
            }
            .encode()),
        });
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        assert!(matches!(
            session.announce(&mut tracker, &announce_params()),
            Err(SessionError::TransactionMismatch { sent, received })
                if sent == FIRST_TID + 1 && received == FIRST_TID
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_announce_cancelled_clears_connection() {
        let mut tracker = FakeTracker::new(|request: &[u8]| match action_of(request) {
            0 => Ok(connect_reply(request)),
            _ => Err(TransportError::Cancelled),
        });
        let mut session = session();

        session.connect(&mut tracker).unwrap();
        assert!(matches!(
            session.announce(&mut tracker, &announce_params()),
            Err(SessionError::Cancelled)
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.connection_id(), None);
    }
}
