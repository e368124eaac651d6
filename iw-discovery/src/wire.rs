//! Datagram formats shared by the [`Advertiser`](crate::Advertiser) and the
//! [`Discoverer`](crate::Discoverer).
//!
//! A discovery request is exactly the bytes of `iw-discovery`. An
//! advertisement is the bytes of `iw-advertisement` followed by the
//! advertised port as a little-endian `u16`.

pub const DISCOVERY_REQUEST: &[u8] = b"iw-discovery";
pub const ADVERTISEMENT_PREFIX: &[u8] = b"iw-advertisement";
pub const ADVERTISEMENT_LEN: usize = ADVERTISEMENT_PREFIX.len() + 2;

pub fn is_discovery_request(datagram: &[u8]) -> bool {
    datagram == DISCOVERY_REQUEST
}

pub fn encode_advertisement(port: u16) -> [u8; ADVERTISEMENT_LEN] {
    let mut packet = [0u8; ADVERTISEMENT_LEN];
    packet[..ADVERTISEMENT_PREFIX.len()].copy_from_slice(ADVERTISEMENT_PREFIX);
    packet[ADVERTISEMENT_PREFIX.len()..].copy_from_slice(&port.to_le_bytes());
    packet
}

/// Returns the advertised port if `datagram` starts with the advertisement
/// prefix and carries the two port bytes after it. Anything past those is
/// ignored
pub fn decode_advertisement(datagram: &[u8]) -> Option<u16> {
    let port = datagram.strip_prefix(ADVERTISEMENT_PREFIX)?.get(..2)?;
    Some(u16::from_le_bytes([port[0], port[1]]))
}
