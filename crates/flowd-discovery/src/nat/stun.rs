//! STUN Binding (RFC 5389)
//!
//! Just enough of STUN to learn the server reflexive (NAT-mapped) address of
//! a local UDP socket: the Binding request, the success and error responses,
//! and the MAPPED-ADDRESS / XOR-MAPPED-ADDRESS attributes. Authentication,
//! MESSAGE-INTEGRITY and FINGERPRINT are not supported; unknown attributes
//! are carried through opaquely.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Default STUN timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_ERROR_CODE: u16 = 0x0009;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_SOFTWARE: u16 = 0x8022;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageClass {
    /// Request message
    Request,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
    /// Indication (no response expected)
    Indication,
}

/// STUN method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    /// Binding request/response
    Binding,
}

impl StunMessageType {
    /// Encode method and class into the 16-bit message type field
    ///
    /// RFC 5389 Section 6 encoding:
    /// ```text
    ///  0                 1
    ///  2  3  4 5 6 7 8 9 0 1 2 3 4 5
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// |M |M |M|M|M|C|M|M|M|C|M|M|M|M|
    /// |11|10|9|8|7|1|6|5|4|0|3|2|1|0|
    /// +--+--+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    fn encode(self, class: StunMessageClass) -> u16 {
        let method: u16 = match self {
            Self::Binding => 0x0001,
        };
        let class_bits: u16 = match class {
            StunMessageClass::Request => 0b00,
            StunMessageClass::Indication => 0b01,
            StunMessageClass::SuccessResponse => 0b10,
            StunMessageClass::ErrorResponse => 0b11,
        };

        (method & 0x0F)
            | ((class_bits & 0x01) << 4)
            | ((method & 0x70) << 1)
            | ((class_bits & 0x02) << 7)
            | ((method & 0xF80) << 2)
    }

    fn decode(msg_type: u16) -> Result<(Self, StunMessageClass), StunError> {
        if msg_type & 0xC000 != 0 {
            return Err(StunError::InvalidMessageType);
        }

        let class = match ((msg_type >> 4) & 0x01) | ((msg_type >> 7) & 0x02) {
            0b00 => StunMessageClass::Request,
            0b01 => StunMessageClass::Indication,
            0b10 => StunMessageClass::SuccessResponse,
            _ => StunMessageClass::ErrorResponse,
        };

        let method = (msg_type & 0x0F) | ((msg_type >> 1) & 0x70) | ((msg_type >> 2) & 0xF80);
        match method {
            0x0001 => Ok((Self::Binding, class)),
            _ => Err(StunError::InvalidMessageType),
        }
    }
}

/// STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunAttribute {
    /// MAPPED-ADDRESS (0x0001), sent by RFC 3489 era servers
    MappedAddress(SocketAddr),
    /// XOR-MAPPED-ADDRESS (0x0020), preferred over MAPPED-ADDRESS
    XorMappedAddress(SocketAddr),
    /// ERROR-CODE (0x0009)
    ErrorCode {
        /// Numeric code, class * 100 + number
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// SOFTWARE (0x8022)
    Software(String),
    /// Any other attribute
    Unknown(u16, Vec<u8>),
}

impl StunAttribute {
    fn attr_type(&self) -> u16 {
        match self {
            Self::MappedAddress(_) => ATTR_MAPPED_ADDRESS,
            Self::ErrorCode { .. } => ATTR_ERROR_CODE,
            Self::XorMappedAddress(_) => ATTR_XOR_MAPPED_ADDRESS,
            Self::Software(_) => ATTR_SOFTWARE,
            Self::Unknown(t, _) => *t,
        }
    }

    fn encode(&self, transaction_id: &[u8; 12], out: &mut Vec<u8>) {
        let value = match self {
            Self::MappedAddress(addr) => encode_address(*addr, None),
            Self::XorMappedAddress(addr) => encode_address(*addr, Some(transaction_id)),
            Self::ErrorCode { code, reason } => {
                let mut value = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
                value.extend_from_slice(reason.as_bytes());
                value
            }
            Self::Software(s) => s.as_bytes().to_vec(),
            Self::Unknown(_, data) => data.clone(),
        };

        out.extend_from_slice(&self.attr_type().to_be_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(&value);
        let padding = (4 - (value.len() % 4)) % 4;
        out.extend(std::iter::repeat_n(0, padding));
    }

    fn decode(attr_type: u16, value: &[u8], transaction_id: &[u8; 12]) -> Result<Self, StunError> {
        match attr_type {
            ATTR_MAPPED_ADDRESS => Ok(Self::MappedAddress(decode_address(value, None)?)),
            ATTR_XOR_MAPPED_ADDRESS => Ok(Self::XorMappedAddress(decode_address(
                value,
                Some(transaction_id),
            )?)),
            ATTR_ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute);
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Ok(Self::ErrorCode { code, reason })
            }
            ATTR_SOFTWARE => Ok(Self::Software(String::from_utf8_lossy(value).into_owned())),
            _ => Ok(Self::Unknown(attr_type, value.to_vec())),
        }
    }
}

/// XOR key: magic cookie, followed by the transaction id for IPv6
fn xor_key(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_address(addr: SocketAddr, xor_with: Option<&[u8; 12]>) -> Vec<u8> {
    let key = xor_with.map(xor_key);
    let port_mask = if key.is_some() { (MAGIC_COOKIE >> 16) as u16 } else { 0 };

    let mut value = vec![0];
    let octets: Vec<u8> = match addr.ip() {
        IpAddr::V4(ip) => {
            value.push(FAMILY_IPV4);
            ip.octets().to_vec()
        }
        IpAddr::V6(ip) => {
            value.push(FAMILY_IPV6);
            ip.octets().to_vec()
        }
    };
    value.extend_from_slice(&(addr.port() ^ port_mask).to_be_bytes());
    value.extend(
        octets
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ key.map_or(0, |k| k[i])),
    );
    value
}

fn decode_address(value: &[u8], xor_with: Option<&[u8; 12]>) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let key = xor_with.map(xor_key);
    let port_mask = if key.is_some() { (MAGIC_COOKIE >> 16) as u16 } else { 0 };
    let port = u16::from_be_bytes([value[2], value[3]]) ^ port_mask;
    let unmask = |i: usize, b: u8| b ^ key.map_or(0, |k| k[i]);

    let ip = match value[1] {
        FAMILY_IPV4 => {
            let raw = value.get(4..8).ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 4];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = unmask(i, *b);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let raw = value.get(4..20).ok_or(StunError::InvalidAttribute)?;
            let mut octets = [0u8; 16];
            for (i, b) in raw.iter().enumerate() {
                octets[i] = unmask(i, *b);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// STUN message
#[derive(Debug, Clone)]
pub struct StunMessage {
    /// Message type
    pub message_type: StunMessageType,
    /// Message class
    pub message_class: StunMessageClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// Message attributes
    pub attributes: Vec<StunAttribute>,
}

impl StunMessage {
    /// Create a new Binding request with a random transaction id
    #[must_use]
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut transaction_id);

        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::Request,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Success response to `transaction_id` reporting `mapped`
    #[must_use]
    pub fn binding_success(transaction_id: [u8; 12], mapped: SocketAddr) -> Self {
        Self {
            message_type: StunMessageType::Binding,
            message_class: StunMessageClass::SuccessResponse,
            transaction_id,
            attributes: vec![StunAttribute::XorMappedAddress(mapped)],
        }
    }

    /// Add an attribute to the message
    pub fn add_attribute(&mut self, attr: StunAttribute) {
        self.attributes.push(attr);
    }

    /// Encode message to bytes
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + 32);
        bytes.extend_from_slice(&self.message_type.encode(self.message_class).to_be_bytes());
        bytes.extend_from_slice(&[0u8; 2]);
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);

        for attr in &self.attributes {
            attr.encode(&self.transaction_id, &mut bytes);
        }

        // Message length excludes the 20-byte header
        let msg_length = (bytes.len() - HEADER_SIZE) as u16;
        bytes[2..4].copy_from_slice(&msg_length.to_be_bytes());
        bytes
    }

    /// Decode message from bytes
    ///
    /// Attributes that fail to decode are dropped; a truncated attribute
    /// ends parsing.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..HEADER_SIZE]);
        let (message_type, message_class) = StunMessageType::decode(msg_type)?;

        let end = bytes.len().min(HEADER_SIZE + msg_length);
        let mut attributes = Vec::new();
        let mut offset = HEADER_SIZE;

        while offset + 4 <= end {
            let attr_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let attr_length = usize::from(u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]));
            offset += 4;

            let Some(value) = bytes.get(offset..offset + attr_length) else {
                break;
            };
            if let Ok(attr) = StunAttribute::decode(attr_type, value, &transaction_id) {
                attributes.push(attr);
            }
            offset += attr_length + (4 - (attr_length % 4)) % 4;
        }

        Ok(Self {
            message_type,
            message_class,
            transaction_id,
            attributes,
        })
    }

    /// XOR-MAPPED-ADDRESS, if present
    #[must_use]
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// MAPPED-ADDRESS, if present
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::MappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Reflexive address: XOR-MAPPED-ADDRESS, falling back to MAPPED-ADDRESS
    #[must_use]
    pub fn reflexive_address(&self) -> Option<SocketAddr> {
        self.xor_mapped_address().or_else(|| self.mapped_address())
    }

    /// ERROR-CODE value, if present
    #[must_use]
    pub fn error_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|attr| match attr {
            StunAttribute::ErrorCode { code, .. } => Some(*code),
            _ => None,
        })
    }
}

/// STUN client for server reflexive address discovery
#[derive(Debug)]
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    /// Bind a new STUN client to a local address
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set query timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Get local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be determined
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Ask `server` for this socket's reflexive address
    ///
    /// Datagrams from other sources, undecodable datagrams and responses to
    /// other transactions (such as a late answer to an earlier query on the
    /// same socket) are discarded until the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns `StunError` if:
    /// - Network I/O fails
    /// - No matching response arrives within the timeout
    /// - The matching response is an error response, has an unexpected
    ///   class, or carries no mapped address
    pub async fn get_mapped_address(&self, server: SocketAddr) -> Result<SocketAddr, StunError> {
        let request = StunMessage::binding_request();
        self.socket.send_to(&request.encode(), server).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut buf = [0u8; 1024];
        let response = loop {
            let (len, from) = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf))
                .await
                .map_err(|_| StunError::Timeout)??;

            if from != server {
                tracing::debug!(%from, %server, "discarding datagram from unexpected source");
                continue;
            }
            match StunMessage::decode(&buf[..len]) {
                Ok(response) if response.transaction_id == request.transaction_id => {
                    break response;
                }
                Ok(_) => tracing::debug!(%server, "discarding response to another transaction"),
                Err(e) => tracing::debug!(%server, error = %e, "discarding malformed response"),
            }
        };

        match response.message_class {
            StunMessageClass::SuccessResponse => response
                .reflexive_address()
                .ok_or(StunError::MissingAttribute),
            StunMessageClass::ErrorResponse => {
                Err(StunError::ErrorResponse(response.error_code().unwrap_or(0)))
            }
            _ => Err(StunError::InvalidMessageType),
        }
    }
}

/// STUN error types
#[derive(Debug)]
pub enum StunError {
    /// I/O error
    Io(std::io::Error),
    /// Query timeout
    Timeout,
    /// Message shorter than the fixed header
    MessageTooShort,
    /// Invalid magic cookie
    InvalidMagicCookie,
    /// Unknown method or unexpected class
    InvalidMessageType,
    /// Malformed attribute
    InvalidAttribute,
    /// Error response received, with its ERROR-CODE (0 if absent)
    ErrorResponse(u16),
    /// Success response without a mapped address
    MissingAttribute,
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout => write!(f, "STUN query timeout"),
            Self::MessageTooShort => write!(f, "STUN message too short"),
            Self::InvalidMagicCookie => write!(f, "Invalid STUN magic cookie"),
            Self::InvalidMessageType => write!(f, "Invalid STUN message type"),
            Self::InvalidAttribute => write!(f, "Invalid STUN attribute"),
            Self::ErrorResponse(code) => write!(f, "STUN error response ({code})"),
            Self::MissingAttribute => write!(f, "Missing required STUN attribute"),
        }
    }
}

impl std::error::Error for StunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StunError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_message_type_encoding() {
        assert_eq!(StunMessageType::Binding.encode(StunMessageClass::Request), 0x0001);
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::SuccessResponse),
            0x0101
        );
        assert_eq!(
            StunMessageType::Binding.encode(StunMessageClass::ErrorResponse),
            0x0111
        );
        assert_eq!(
            StunMessageType::decode(0x0111).unwrap(),
            (StunMessageType::Binding, StunMessageClass::ErrorResponse)
        );
        assert!(StunMessageType::decode(0x0003).is_err());
        assert!(StunMessageType::decode(0x8001).is_err());
    }

    #[test]
    fn test_binding_request_layout() {
        let msg = StunMessage::binding_request();
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..2], &[0x00, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x00]);
        assert_eq!(&bytes[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&bytes[8..20], &msg.transaction_id);
    }

    #[test]
    fn test_xor_mapped_address_rfc5769_vector() {
        // RFC 5769 section 2.2, IPv4 response
        let tid = [
            0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
        ];
        let value = [0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43];
        let attr = StunAttribute::decode(ATTR_XOR_MAPPED_ADDRESS, &value, &tid).unwrap();
        assert_eq!(
            attr,
            StunAttribute::XorMappedAddress("192.0.2.1:32853".parse().unwrap())
        );
    }

    #[test]
    fn test_success_response_v6() {
        let mapped: SocketAddr = "[2001:db8:1234:5678:11:2233:4455:6677]:32853".parse().unwrap();
        let tid = [7u8; 12];
        let bytes = StunMessage::binding_success(tid, mapped).encode();

        let decoded = StunMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.message_class, StunMessageClass::SuccessResponse);
        assert_eq!(decoded.transaction_id, tid);
        assert_eq!(decoded.xor_mapped_address(), Some(mapped));
    }

    #[test]
    fn test_mapped_address_fallback() {
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let mut msg = StunMessage::binding_request();
        msg.message_class = StunMessageClass::SuccessResponse;
        msg.add_attribute(StunAttribute::Software("legacy".into()));
        msg.add_attribute(StunAttribute::MappedAddress(mapped));

        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.xor_mapped_address(), None);
        assert_eq!(decoded.reflexive_address(), Some(mapped));
    }

    #[test]
    fn test_error_code_attribute() {
        let mut msg = StunMessage::binding_request();
        msg.message_class = StunMessageClass::ErrorResponse;
        msg.add_attribute(StunAttribute::ErrorCode {
            code: 420,
            reason: "Unknown Attribute".into(),
        });
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.error_code(), Some(420));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(StunError::MessageTooShort)
        ));
        let mut bytes = StunMessage::binding_request().encode();
        bytes[4] = 0;
        assert!(matches!(
            StunMessage::decode(&bytes),
            Err(StunError::InvalidMagicCookie)
        ));
    }

    #[test]
    fn test_truncated_attribute_is_dropped() {
        let mut bytes =
            StunMessage::binding_success([1u8; 12], "192.0.2.1:1".parse().unwrap()).encode();
        bytes.truncate(bytes.len() - 2);
        let decoded = StunMessage::decode(&bytes).unwrap();
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn test_stun_error_display() {
        assert_eq!(StunError::Timeout.to_string(), "STUN query timeout");
        assert_eq!(
            StunError::ErrorResponse(401).to_string(),
            "STUN error response (401)"
        );
        let io = StunError::from(std::io::Error::other("boom"));
        assert!(std::error::Error::source(&io).is_some());
    }

    #[tokio::test]
    async fn test_client_against_loopback_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let response = StunMessage::binding_success(request.transaction_id, mapped);
            server.send_to(&response.encode(), from).await.unwrap();
        });

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(client.get_mapped_address(server_addr).await.unwrap(), mapped);
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = StunClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        client.set_timeout(Duration::from_millis(50));
        let err = client
            .get_mapped_address(silent.local_addr().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StunError::Timeout));
    }

    #[tokio::test]
    async fn test_client_skips_foreign_transaction() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let stray = StunMessage::binding_success([9u8; 12], "192.0.2.1:1".parse().unwrap());
            server.send_to(&stray.encode(), from).await.unwrap();
            server.send_to(b"not stun", from).await.unwrap();
            let response = StunMessage::binding_success(request.transaction_id, mapped);
            server.send_to(&response.encode(), from).await.unwrap();
        });

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(client.get_mapped_address(server_addr).await.unwrap(), mapped);
    }

    #[tokio::test]
    async fn test_client_times_out_on_foreign_transaction_only() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let response = StunMessage::binding_success([9u8; 12], "192.0.2.1:1".parse().unwrap());
            server.send_to(&response.encode(), from).await.unwrap();
            let _keep = server;
            std::future::pending::<()>().await;
        });

        let mut client = StunClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        client.set_timeout(Duration::from_millis(100));
        let err = client.get_mapped_address(server_addr).await.unwrap_err();
        assert!(matches!(err, StunError::Timeout));
    }

    #[tokio::test]
    async fn test_client_ignores_other_sources() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mapped: SocketAddr = "203.0.113.7:40000".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            // same transaction id, wrong sender
            let forged =
                StunMessage::binding_success(request.transaction_id, "192.0.2.1:1".parse().unwrap());
            intruder.send_to(&forged.encode(), from).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let response = StunMessage::binding_success(request.transaction_id, mapped);
            server.send_to(&response.encode(), from).await.unwrap();
        });

        let client = StunClient::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_eq!(client.get_mapped_address(server_addr).await.unwrap(), mapped);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn xor_mapped_address_survives_encoding(
                ip in any::<IpAddr>(),
                port in any::<u16>(),
                tid in any::<[u8; 12]>(),
            ) {
                let addr = SocketAddr::new(ip, port);
                let decoded = StunMessage::decode(&StunMessage::binding_success(tid, addr).encode()).unwrap();
                prop_assert_eq!(decoded.transaction_id, tid);
                prop_assert_eq!(decoded.xor_mapped_address(), Some(addr));
            }

            #[test]
            fn truncated_messages_rejected(cut in 0usize..HEADER_SIZE) {
                let bytes = StunMessage::binding_request().encode();
                prop_assert!(StunMessage::decode(&bytes[..cut]).is_err());
            }
        }
    }
}
