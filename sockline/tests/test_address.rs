use std::net;

use proptest::prelude::*;
use sockline::{AddrParseError, IpAddress, Ipv4, Ipv6};

proptest! {
  #[test]
  fn ipv4_text_round_trips(octets in any::<[u8; 4]>()) {
    let addr = Ipv4::from_octets(octets);
    let text = addr.to_string();
    prop_assert_eq!(Ipv4::parse(&text), Ok(addr));
    prop_assert_eq!(text, net::Ipv4Addr::from(octets).to_string());
    prop_assert_eq!(Ipv4::from_u32(addr.to_u32()), addr);
  }

  #[test]
  fn ipv6_text_round_trips(words in any::<[u16; 8]>()) {
    let addr = Ipv6::from_words(words);
    let text = addr.to_string();
    prop_assert_eq!(Ipv6::parse(&text), Ok(addr));
    prop_assert_eq!(IpAddress::parse(&text), Ok(IpAddress::V6(addr)));
    prop_assert_eq!(addr.words(), words);
    prop_assert_eq!(net::Ipv6Addr::from(addr), net::Ipv6Addr::from(words));
  }

  #[test]
  fn out_of_range_octets_fail(octet in 256u32..100_000) {
    let text = format!("10.0.{octet}.1");
    let mut addr = Ipv4::LOCALHOST;
    let is_out_of_range = matches!(
      addr.set_from_str(&text),
      Err(AddrParseError::OutOfRange { .. })
    );
    prop_assert!(is_out_of_range);
    prop_assert_eq!(addr, Ipv4::LOCALHOST);
  }
}

#[test]
fn test_malformed_strings() {
  assert_eq!(IpAddress::parse(""), Ok(IpAddress::unspecified(false)));
  assert!(matches!(Ipv4::parse("256.0.0.1"), Err(AddrParseError::OutOfRange { .. })));
  assert!(matches!(Ipv4::parse("1.2.3"), Err(AddrParseError::Format { expected_fields: 4 })));
  assert!(matches!(Ipv4::parse("1.2.x.4"), Err(AddrParseError::NotANumber(_))));
  assert!(Ipv6::parse("::1").is_err());
  assert!(Ipv6::parse("0:0:0:0:0:0:0:65536").is_err());
  assert!(IpAddress::parse("1.2.3.4.5").is_err());
}

#[test]
fn test_versions_never_compare_equal() {
  let v4 = IpAddress::unspecified(false);
  let v6 = IpAddress::unspecified(true);
  assert_ne!(v4, v6);
  assert_eq!(v4.version(), 4);
  assert_eq!(v6.version(), 6);
  assert_eq!(IpAddress::localhost(true), "0:0:0:0:0:0:0:1");
  assert_eq!(IpAddress::localhost(false).socket_addr(8080).to_string(), "127.0.0.1:8080");
}
