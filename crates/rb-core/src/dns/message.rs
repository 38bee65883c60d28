//! Minimal typed DNS message model.
//!
//! Transports own the wire encoding; the router only needs questions, answer
//! records, rcodes, and the OPT pseudo-record for EDNS0 client-subnet.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_HTTPS: u16 = 65;

pub const CLASS_IN: u16 = 1;

pub const RCODE_SUCCESS: u16 = 0;
pub const RCODE_FORMAT_ERROR: u16 = 1;
pub const RCODE_SERVER_FAILURE: u16 = 2;
pub const RCODE_NAME_ERROR: u16 = 3;
pub const RCODE_REFUSED: u16 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: u16) -> Self {
        Self {
            name: fqdn_to_domain(&name.into()),
            qtype,
            qclass: CLASS_IN,
        }
    }
}

/// EDNS0 client-subnet option payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSubnet {
    pub family: u16,
    pub source_prefix: u8,
    pub scope_prefix: u8,
    pub address: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdnsOption {
    Subnet(ClientSubnet),
    Other { code: u16, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Opt(Vec<EdnsOption>),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    pub fn a(name: impl Into<String>, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl,
            data: RecordData::A(addr),
        }
    }

    pub fn aaaa(name: impl Into<String>, ttl: u32, addr: Ipv6Addr) -> Self {
        Self {
            name: name.into(),
            rtype: TYPE_AAAA,
            class: CLASS_IN,
            ttl,
            data: RecordData::Aaaa(addr),
        }
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(addr) => Some(IpAddr::V4(addr)),
            RecordData::Aaaa(addr) => Some(IpAddr::V6(addr)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub rcode: u16,
    pub question: Vec<Question>,
    pub answer: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

impl Message {
    /// Build a query for `domain` with a random id.
    pub fn query(domain: &str, qtype: u16) -> Self {
        Self {
            id: rand::random(),
            question: vec![Question::new(domain, qtype)],
            ..Self::default()
        }
    }

    /// Build an empty response to `query` with the given rcode, echoing the
    /// id and question.
    pub fn response_to(query: &Message, rcode: u16) -> Self {
        Self {
            id: query.id,
            response: true,
            rcode,
            question: query.question.clone(),
            ..Self::default()
        }
    }

    /// Addresses carried by A/AAAA answer records.
    pub fn answer_addrs(&self) -> Vec<IpAddr> {
        self.answer.iter().filter_map(Record::as_ip).collect()
    }

    /// Smallest TTL across answer records, if any.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answer.iter().map(|record| record.ttl).min()
    }

    /// Overwrite every answer TTL.
    pub fn rewrite_ttl(&mut self, ttl: u32) {
        for record in &mut self.answer {
            record.ttl = ttl;
        }
    }
}

/// Normalize a DNS name for routing: lowercase, no trailing dot.
pub fn fqdn_to_domain(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Stamp `client_subnet` onto a copy of `message`.
///
/// The copy carries exactly one OPT record with exactly one subnet option:
/// family 1 for IPv4 / 2 for IPv6, the prefix length as source netmask, and
/// the masked prefix address.
pub fn set_client_subnet(message: &Message, client_subnet: &IpNet) -> Message {
    let mut message = message.clone();
    let masked = client_subnet.trunc();
    let subnet = ClientSubnet {
        family: match masked {
            IpNet::V4(_) => 1,
            IpNet::V6(_) => 2,
        },
        source_prefix: masked.prefix_len(),
        scope_prefix: 0,
        address: masked.addr(),
    };

    for record in &mut message.additional {
        if let RecordData::Opt(options) = &mut record.data {
            for option in options.iter_mut() {
                if let EdnsOption::Subnet(existing) = option {
                    *existing = subnet;
                    return message;
                }
            }
            options.push(EdnsOption::Subnet(subnet));
            return message;
        }
    }
    message.additional.push(Record {
        name: ".".to_string(),
        rtype: TYPE_OPT,
        class: CLASS_IN,
        ttl: 0,
        data: RecordData::Opt(vec![EdnsOption::Subnet(subnet)]),
    });
    message
}

/// Read the first EDNS0 subnet option, rejecting out-of-range prefix lengths
/// and unknown families. The returned prefix is masked.
pub fn extract_client_subnet(message: &Message) -> Option<IpNet> {
    let options = message.additional.iter().find_map(|record| {
        if let RecordData::Opt(options) = &record.data {
            Some(options)
        } else {
            None
        }
    })?;
    let subnet = options.iter().find_map(|option| {
        if let EdnsOption::Subnet(subnet) = option {
            Some(subnet)
        } else {
            None
        }
    })?;
    match (subnet.family, subnet.address) {
        (1, IpAddr::V4(addr)) => {
            if subnet.source_prefix > 32 {
                return None;
            }
            Ipv4Net::new(addr, subnet.source_prefix)
                .ok()
                .map(|net| IpNet::V4(net.trunc()))
        }
        (2, IpAddr::V6(addr)) => {
            if subnet.source_prefix > 128 {
                return None;
            }
            Ipv6Net::new(addr, subnet.source_prefix)
                .ok()
                .map(|net| IpNet::V6(net.trunc()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_names_are_normalized() {
        let question = Question::new("Example.COM.", TYPE_A);
        assert_eq!(question.name, "example.com");
    }

    #[test]
    fn client_subnet_round_trips_v4() {
        let message = Message::query("example.com", TYPE_A);
        let prefix: IpNet = "192.0.2.55/24".parse().unwrap();
        let stamped = set_client_subnet(&message, &prefix);
        assert_eq!(
            extract_client_subnet(&stamped),
            Some("192.0.2.0/24".parse().unwrap())
        );
        // The source message is untouched.
        assert!(extract_client_subnet(&message).is_none());
    }

    #[test]
    fn client_subnet_round_trips_v6() {
        let message = Message::query("example.com", TYPE_AAAA);
        let prefix: IpNet = "2001:db8::1/56".parse().unwrap();
        let stamped = set_client_subnet(&message, &prefix);
        assert_eq!(
            extract_client_subnet(&stamped),
            Some("2001:db8::/56".parse().unwrap())
        );
    }

    #[test]
    fn restamping_replaces_existing_option() {
        let message = Message::query("example.com", TYPE_A);
        let first = set_client_subnet(&message, &"10.0.0.0/8".parse().unwrap());
        let second = set_client_subnet(&first, &"192.0.2.0/24".parse().unwrap());
        let opt_records = second
            .additional
            .iter()
            .filter(|record| record.rtype == TYPE_OPT)
            .count();
        assert_eq!(opt_records, 1);
        assert_eq!(
            extract_client_subnet(&second),
            Some("192.0.2.0/24".parse().unwrap())
        );
    }

    #[test]
    fn out_of_range_and_unknown_families_are_rejected() {
        let mut message = Message::query("example.com", TYPE_A);
        message.additional.push(Record {
            name: ".".to_string(),
            rtype: TYPE_OPT,
            class: CLASS_IN,
            ttl: 0,
            data: RecordData::Opt(vec![EdnsOption::Subnet(ClientSubnet {
                family: 1,
                source_prefix: 33,
                scope_prefix: 0,
                address: "192.0.2.0".parse().unwrap(),
            })]),
        });
        assert!(extract_client_subnet(&message).is_none());

        if let RecordData::Opt(options) = &mut message.additional.last_mut().unwrap().data {
            options[0] = EdnsOption::Subnet(ClientSubnet {
                family: 7,
                source_prefix: 8,
                scope_prefix: 0,
                address: "192.0.2.0".parse().unwrap(),
            });
        }
        assert!(extract_client_subnet(&message).is_none());
    }

    #[test]
    fn rewrite_ttl_touches_all_answers() {
        let mut message = Message::response_to(&Message::query("example.com", TYPE_A), RCODE_SUCCESS);
        message
            .answer
            .push(Record::a("example.com", 300, "192.0.2.1".parse().unwrap()));
        message
            .answer
            .push(Record::a("example.com", 60, "192.0.2.2".parse().unwrap()));
        message.rewrite_ttl(15);
        assert!(message.answer.iter().all(|record| record.ttl == 15));
        assert_eq!(message.min_answer_ttl(), Some(15));
    }
}
