//! IPv4/IPv6 address values.
//!
//! Textual forms are strict: IPv4 is exactly four dot-separated decimal
//! integers in `0..=255`, IPv6 is exactly eight colon-separated DECIMAL
//! integers in `0..=65535` (`"0:0:0:0:0:0:0:1"` is the loopback address).
//! Abbreviated IPv6 forms such as `"::1"` and hexadecimal words are not
//! supported and fail to parse. An empty string parses to the all-zero
//! address.
//!
//! All conversions between numbers and bytes go through explicit big-endian
//! functions on fixed-size arrays, so the in-memory layout never depends on the
//! host byte order.

use std::{
  fmt, io,
  net::{self, SocketAddr},
  ptr,
  str::FromStr,
};

/// Error returned when an address string is malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrParseError {
  /// The string does not have the expected number of numeric fields.
  Format { expected_fields: usize },
  /// A field is not a decimal integer.
  NotANumber(String),
  /// A field is outside `0..=max`.
  OutOfRange { value: String, max: u32 },
}

impl std::error::Error for AddrParseError {}

impl fmt::Display for AddrParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Format { expected_fields } => write!(
        f,
        "wrong address string format, expected {expected_fields} numeric fields"
      ),
      Self::NotANumber(field) => write!(f, "'{field}' is not a decimal number"),
      Self::OutOfRange { value, max } => {
        write!(f, "address field {value} is outside 0..={max}")
      }
    }
  }
}

fn parse_fields<const N: usize>(
  s: &str,
  separator: char,
  max: u32,
) -> Result<[u32; N], AddrParseError> {
  let mut out = [0u32; N];
  let mut count = 0;

  for field in s.split(separator) {
    if count == N {
      return Err(AddrParseError::Format { expected_fields: N });
    }
    if field.is_empty() {
      return Err(AddrParseError::Format { expected_fields: N });
    }

    let digits = field.strip_prefix('-').unwrap_or(field);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
      return Err(AddrParseError::NotANumber(field.to_owned()));
    }
    // Negative numbers are well-formed but never in range.
    if digits.len() != field.len() {
      return Err(AddrParseError::OutOfRange { value: field.to_owned(), max });
    }

    let value = field.parse::<u64>().map_err(|_| {
      AddrParseError::OutOfRange { value: field.to_owned(), max }
    })?;
    if value > max as u64 {
      return Err(AddrParseError::OutOfRange { value: field.to_owned(), max });
    }

    out[count] = value as u32;
    count += 1;
  }

  if count != N {
    return Err(AddrParseError::Format { expected_fields: N });
  }
  Ok(out)
}

/// An IPv4 address stored as four ordered octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv4 {
  octets: [u8; 4],
}

impl Ipv4 {
  pub const UNSPECIFIED: Self = Self::new(0, 0, 0, 0);
  pub const LOCALHOST: Self = Self::new(127, 0, 0, 1);

  /// Builds `net.host.lh.imp_number`.
  pub const fn new(net: u8, host: u8, lh: u8, imp_number: u8) -> Self {
    Self { octets: [net, host, lh, imp_number] }
  }

  pub const fn from_octets(octets: [u8; 4]) -> Self {
    Self { octets }
  }

  /// Interprets `num` as a numeric address whose most significant byte is the
  /// first octet (`0x7f00_0001` is `127.0.0.1`).
  pub const fn from_u32(num: u32) -> Self {
    Self { octets: num.to_be_bytes() }
  }

  pub const fn to_u32(&self) -> u32 {
    u32::from_be_bytes(self.octets)
  }

  pub const fn octets(&self) -> [u8; 4] {
    self.octets
  }

  /// Parses the dotted form. An empty string yields `0.0.0.0`.
  pub fn parse(s: &str) -> Result<Self, AddrParseError> {
    if s.is_empty() {
      return Ok(Self::UNSPECIFIED);
    }
    let [a, b, c, d] = parse_fields::<4>(s, '.', u8::MAX as u32)?;
    Ok(Self::new(a as u8, b as u8, c as u8, d as u8))
  }

  /// Replaces this address with the parsed value of `s`.
  ///
  /// On error the address is left untouched.
  pub fn set_from_str(&mut self, s: &str) -> Result<(), AddrParseError> {
    *self = Self::parse(s)?;
    Ok(())
  }

  /// Returns the octet at `index`, or `None` past the fourth octet.
  pub fn octet(&self, index: usize) -> Option<u8> {
    self.octets.get(index).copied()
  }

  /// Sets the octet at `index`. Returns false when `index` is out of range.
  pub fn set_octet(&mut self, index: usize, value: u8) -> bool {
    match self.octets.get_mut(index) {
      Some(slot) => {
        *slot = value;
        true
      }
      None => false,
    }
  }

  pub fn net(&self) -> u8 {
    self.octets[0]
  }

  pub fn set_net(&mut self, net: u8) {
    self.octets[0] = net;
  }

  pub fn host(&self) -> u8 {
    self.octets[1]
  }

  pub fn set_host(&mut self, host: u8) {
    self.octets[1] = host;
  }

  pub fn lh(&self) -> u8 {
    self.octets[2]
  }

  pub fn set_lh(&mut self, lh: u8) {
    self.octets[2] = lh;
  }

  pub fn imp_number(&self) -> u8 {
    self.octets[3]
  }

  pub fn set_imp_number(&mut self, imp_number: u8) {
    self.octets[3] = imp_number;
  }
}

impl fmt::Display for Ipv4 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let [a, b, c, d] = self.octets;
    write!(f, "{a}.{b}.{c}.{d}")
  }
}

impl FromStr for Ipv4 {
  type Err = AddrParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl From<net::Ipv4Addr> for Ipv4 {
  fn from(addr: net::Ipv4Addr) -> Self {
    Self::from_octets(addr.octets())
  }
}

impl From<Ipv4> for net::Ipv4Addr {
  fn from(addr: Ipv4) -> Self {
    net::Ipv4Addr::from(addr.octets)
  }
}

/// An IPv6 address stored as sixteen bytes (eight big-endian words).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ipv6 {
  bytes: [u8; 16],
}

impl Ipv6 {
  pub const UNSPECIFIED: Self = Self { bytes: [0; 16] };
  pub const LOCALHOST: Self = Self::from_words([0, 0, 0, 0, 0, 0, 0, 1]);

  pub const fn from_bytes(bytes: [u8; 16]) -> Self {
    Self { bytes }
  }

  pub const fn from_words(words: [u16; 8]) -> Self {
    let mut bytes = [0u8; 16];
    let mut i = 0;
    while i < 8 {
      let [hi, lo] = words[i].to_be_bytes();
      bytes[i * 2] = hi;
      bytes[i * 2 + 1] = lo;
      i += 1;
    }
    Self { bytes }
  }

  pub const fn bytes(&self) -> [u8; 16] {
    self.bytes
  }

  pub fn words(&self) -> [u16; 8] {
    let mut words = [0u16; 8];
    for (i, word) in words.iter_mut().enumerate() {
      *word = u16::from_be_bytes([self.bytes[i * 2], self.bytes[i * 2 + 1]]);
    }
    words
  }

  /// Parses the eight-word decimal form. An empty string yields the
  /// unspecified address.
  pub fn parse(s: &str) -> Result<Self, AddrParseError> {
    if s.is_empty() {
      return Ok(Self::UNSPECIFIED);
    }
    let fields = parse_fields::<8>(s, ':', u16::MAX as u32)?;
    Ok(Self::from_words(fields.map(|w| w as u16)))
  }

  pub fn set_from_str(&mut self, s: &str) -> Result<(), AddrParseError> {
    *self = Self::parse(s)?;
    Ok(())
  }

  pub fn byte(&self, index: usize) -> Option<u8> {
    self.bytes.get(index).copied()
  }

  pub fn set_byte(&mut self, index: usize, value: u8) -> bool {
    match self.bytes.get_mut(index) {
      Some(slot) => {
        *slot = value;
        true
      }
      None => false,
    }
  }

  pub fn word(&self, index: usize) -> Option<u16> {
    if index >= 8 {
      return None;
    }
    Some(u16::from_be_bytes([self.bytes[index * 2], self.bytes[index * 2 + 1]]))
  }

  pub fn set_word(&mut self, index: usize, value: u16) -> bool {
    if index >= 8 {
      return false;
    }
    let [hi, lo] = value.to_be_bytes();
    self.bytes[index * 2] = hi;
    self.bytes[index * 2 + 1] = lo;
    true
  }
}

impl fmt::Display for Ipv6 {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, word) in self.words().iter().enumerate() {
      if i > 0 {
        f.write_str(":")?;
      }
      write!(f, "{word}")?;
    }
    Ok(())
  }
}

impl FromStr for Ipv6 {
  type Err = AddrParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl From<net::Ipv6Addr> for Ipv6 {
  fn from(addr: net::Ipv6Addr) -> Self {
    Self::from_bytes(addr.octets())
  }
}

impl From<Ipv6> for net::Ipv6Addr {
  fn from(addr: Ipv6) -> Self {
    net::Ipv6Addr::from(addr.bytes)
  }
}

/// An address of either IP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddress {
  V4(Ipv4),
  V6(Ipv6),
}

impl IpAddress {
  /// Parses `s` as IPv4 first and falls back to IPv6.
  pub fn parse(s: &str) -> Result<Self, AddrParseError> {
    match Ipv4::parse(s) {
      Ok(v4) => Ok(Self::V4(v4)),
      Err(v4_err) => match Ipv6::parse(s) {
        Ok(v6) => Ok(Self::V6(v6)),
        // A string with dots was meant as IPv4; report that error.
        Err(_) if s.contains('.') => Err(v4_err),
        Err(v6_err) => Err(v6_err),
      },
    }
  }

  /// Wildcard address of the requested family.
  pub const fn unspecified(ipv6: bool) -> Self {
    if ipv6 { Self::V6(Ipv6::UNSPECIFIED) } else { Self::V4(Ipv4::UNSPECIFIED) }
  }

  pub const fn localhost(ipv6: bool) -> Self {
    if ipv6 { Self::V6(Ipv6::LOCALHOST) } else { Self::V4(Ipv4::LOCALHOST) }
  }

  /// Returns `4` or `6`.
  pub const fn version(&self) -> u8 {
    match self {
      Self::V4(_) => 4,
      Self::V6(_) => 6,
    }
  }

  pub const fn is_ipv6(&self) -> bool {
    matches!(self, Self::V6(_))
  }

  pub fn to_std(&self) -> net::IpAddr {
    match *self {
      Self::V4(v4) => net::IpAddr::V4(v4.into()),
      Self::V6(v6) => net::IpAddr::V6(v6.into()),
    }
  }

  pub fn socket_addr(&self, port: u16) -> SocketAddr {
    SocketAddr::new(self.to_std(), port)
  }
}

impl Default for IpAddress {
  fn default() -> Self {
    Self::V4(Ipv4::UNSPECIFIED)
  }
}

impl fmt::Display for IpAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::V4(v4) => v4.fmt(f),
      Self::V6(v6) => v6.fmt(f),
    }
  }
}

impl FromStr for IpAddress {
  type Err = AddrParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl PartialEq<str> for IpAddress {
  fn eq(&self, other: &str) -> bool {
    self.to_string() == other
  }
}

impl PartialEq<&str> for IpAddress {
  fn eq(&self, other: &&str) -> bool {
    self.to_string() == *other
  }
}

impl From<Ipv4> for IpAddress {
  fn from(addr: Ipv4) -> Self {
    Self::V4(addr)
  }
}

impl From<Ipv6> for IpAddress {
  fn from(addr: Ipv6) -> Self {
    Self::V6(addr)
  }
}

impl From<net::IpAddr> for IpAddress {
  fn from(addr: net::IpAddr) -> Self {
    match addr {
      net::IpAddr::V4(v4) => Self::V4(v4.into()),
      // IPv4-mapped peers on a dual-stack listener are reported as IPv6, the
      // same way the kernel reports them.
      net::IpAddr::V6(v6) => Self::V6(v6.into()),
    }
  }
}

impl From<IpAddress> for net::IpAddr {
  fn from(addr: IpAddress) -> Self {
    addr.to_std()
  }
}

/// Splits a socket address into the crate's address value and port.
pub(crate) fn split_socket_addr(addr: SocketAddr) -> (IpAddress, u16) {
  (addr.ip().into(), addr.port())
}

/// Returns the `index`-th non-loopback IPv4 address of this host.
///
/// A negative index, an index past the last interface, or a failure to list
/// interfaces all yield `127.0.0.1`.
pub fn local_ipv4_addr(index: i32) -> Ipv4 {
  let Ok(index) = usize::try_from(index) else {
    return Ipv4::LOCALHOST;
  };
  match interface_addrs(libc::AF_INET) {
    Ok(addrs) => match addrs.get(index) {
      Some(IpAddress::V4(v4)) => *v4,
      _ => Ipv4::LOCALHOST,
    },
    Err(err) => {
      tracing::debug!(%err, "listing interface addresses failed");
      Ipv4::LOCALHOST
    }
  }
}

/// Returns the `index`-th non-loopback IPv6 address of this host, falling
/// back to the unspecified address the same way [`local_ipv4_addr`] falls
/// back to loopback.
pub fn local_ipv6_addr(index: i32) -> Ipv6 {
  let Ok(index) = usize::try_from(index) else {
    return Ipv6::UNSPECIFIED;
  };
  match interface_addrs(libc::AF_INET6) {
    Ok(addrs) => match addrs.get(index) {
      Some(IpAddress::V6(v6)) => *v6,
      _ => Ipv6::UNSPECIFIED,
    },
    Err(err) => {
      tracing::debug!(%err, "listing interface addresses failed");
      Ipv6::UNSPECIFIED
    }
  }
}

fn interface_addrs(family: libc::c_int) -> io::Result<Vec<IpAddress>> {
  let mut head: *mut libc::ifaddrs = ptr::null_mut();
  syscall!(getifaddrs(&mut head))?;

  let mut out = Vec::new();
  let mut cursor = head;
  while !cursor.is_null() {
    // SAFETY: `cursor` walks the list returned by getifaddrs, which stays
    // valid until freeifaddrs below.
    let ifa = unsafe { &*cursor };
    cursor = ifa.ifa_next;

    let loopback = ifa.ifa_flags & libc::IFF_LOOPBACK as libc::c_uint != 0;
    if ifa.ifa_addr.is_null() || loopback {
      continue;
    }

    // SAFETY: non-null ifa_addr points at a sockaddr whose family tells us
    // which concrete struct it is.
    let sa_family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
    if sa_family != family {
      continue;
    }

    if family == libc::AF_INET {
      let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
      out.push(IpAddress::V4(Ipv4::from_u32(u32::from_be(
        sin.sin_addr.s_addr,
      ))));
    } else {
      let sin6 = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in6) };
      out.push(IpAddress::V6(Ipv6::from_bytes(sin6.sin6_addr.s6_addr)));
    }
  }

  // SAFETY: `head` came from a successful getifaddrs call.
  unsafe { libc::freeifaddrs(head) };
  Ok(out)
}
