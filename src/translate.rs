//! In-flight rewriting of mDNS messages
//!
//! Takes one raw UDP datagram, substitutes every reference to the device
//! identity with the proxy identity, and re-encodes it. The rules are:
//!
//! - PTR questions and PTR records owned by the device's reverse-DNS name
//!   get their name replaced with the proxy's reverse-DNS name.
//! - A records carrying the device's address get the proxy's address.
//! - A questions and every other record pass through untouched.
//!
//! The function is pure over the datagram and the configured identities;
//! every change is reported on the diagnostic stream as a `-old` / `+new`
//! pair for operational visibility.

use crate::identity::Identities;
use hickory_proto::op::{Message, MessageParts, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};

/// Rewrite one mDNS datagram.
///
/// Returns `None` when the payload does not decode as a DNS message or the
/// rewritten message fails to re-encode; the caller must send nothing for
/// that datagram. Messages whose opcode is not a standard query are
/// re-encoded without transformation.
pub fn translate(payload: &[u8], identities: &Identities) -> Option<Vec<u8>> {
  let message = match Message::from_vec(payload) {
    Ok(message) => message,
    Err(e) => {
      tracing::warn!("undecodable mDNS datagram ({} bytes): {}", payload.len(), e);
      tracing::debug!("raw payload: {}", hex_dump(payload));
      return None;
    }
  };

  let message = if message.op_code() == OpCode::Query {
    rewrite_message(message, identities)
  } else {
    message
  };

  match message.to_vec() {
    Ok(bytes) => Some(bytes),
    Err(e) => {
      tracing::warn!("failed to re-encode mDNS message: {}", e);
      None
    }
  }
}

fn rewrite_message(message: Message, identities: &Identities) -> Message {
  let mut parts = MessageParts::from(message);
  parts.queries = parts
    .queries
    .into_iter()
    .map(|q| rewrite_question(q, identities))
    .collect();
  parts.answers = rewrite_section("answer", parts.answers, identities);
  parts.name_servers = rewrite_section("authority", parts.name_servers, identities);
  parts.additionals = rewrite_section("additional", parts.additionals, identities);
  Message::from(parts)
}

/// PTR questions for the device's reverse name ask for the proxy's instead.
/// A questions carry a name to resolve, not an address, and are never touched.
fn rewrite_question(mut question: Query, identities: &Identities) -> Query {
  if question.query_type() == RecordType::PTR
    && question.name() == &identities.device.reverse_name
  {
    let before = format_question(&question);
    question.set_name(identities.proxy.reverse_name.clone());
    tracing::info!("question -{}", before);
    tracing::info!("question +{}", format_question(&question));
  } else {
    tracing::debug!("question  {}", format_question(&question));
  }
  question
}

fn rewrite_section(section: &str, records: Vec<Record>, identities: &Identities) -> Vec<Record> {
  records
    .into_iter()
    .map(|record| {
      let before = format_record(&record);
      let (record, changed) = rewrite_record(record, identities);
      if changed {
        tracing::info!("{} -{}", section, before);
        tracing::info!("{} +{}", section, format_record(&record));
      } else {
        tracing::debug!("{}  {}", section, before);
      }
      record
    })
    .collect()
}

fn rewrite_record(mut record: Record, identities: &Identities) -> (Record, bool) {
  let device_address =
    matches!(record.data(), Some(RData::A(a)) if a.0 == identities.device.address);
  if device_address {
    record.set_data(Some(RData::A(A(identities.proxy.address))));
    return (record, true);
  }

  if record.record_type() == RecordType::PTR
    && record.name() == &identities.device.reverse_name
  {
    record.set_name(identities.proxy.reverse_name.clone());
    return (record, true);
  }

  (record, false)
}

fn format_question(question: &Query) -> String {
  format!(
    "{} {} {}",
    question.name(),
    question.query_class(),
    question.query_type()
  )
}

fn format_record(record: &Record) -> String {
  let data = record
    .data()
    .map(|d| d.to_string())
    .unwrap_or_else(|| "<none>".to_string());
  format!(
    "{} {} {} {} {}",
    record.name(),
    record.ttl(),
    record.dns_class(),
    record.record_type(),
    data
  )
}

fn hex_dump(payload: &[u8]) -> String {
  payload
    .iter()
    .map(|b| format!("{:02x}", b))
    .collect::<Vec<_>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;
  use hickory_proto::op::MessageType;
  use hickory_proto::rr::rdata::{PTR, TXT};
  use hickory_proto::rr::Name;
  use std::net::Ipv4Addr;

  fn identities() -> Identities {
    Identities::new("10.0.0.5".parse().unwrap(), "10.0.0.9".parse().unwrap()).unwrap()
  }

  fn name(s: &str) -> Name {
    Name::from_ascii(s).unwrap()
  }

  fn reparse(bytes: &[u8]) -> Message {
    Message::from_vec(bytes).unwrap()
  }

  #[test]
  fn device_a_record_gets_proxy_address() {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.add_answer(Record::from_rdata(
      name("device.local."),
      120,
      RData::A(A("10.0.0.5".parse().unwrap())),
    ));

    let out = translate(&message.to_vec().unwrap(), &identities()).unwrap();
    let out = reparse(&out);
    let answer = &out.answers()[0];
    assert_eq!(answer.name(), &name("device.local."));
    assert_eq!(answer.ttl(), 120);
    assert_eq!(
      answer.data(),
      Some(&RData::A(A("10.0.0.9".parse().unwrap())))
    );
  }

  #[test]
  fn unrelated_a_record_is_untouched() {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.add_answer(Record::from_rdata(
      name("other.local."),
      60,
      RData::A(A("10.0.0.7".parse().unwrap())),
    ));

    let input = message.to_vec().unwrap();
    let out = translate(&input, &identities()).unwrap();
    assert_eq!(out, input);
  }

  #[test]
  fn ptr_question_for_device_asks_for_proxy() {
    let mut message = Message::new();
    message.add_query(Query::query(
      name("5.0.0.10.in-addr.arpa."),
      RecordType::PTR,
    ));

    let out = translate(&message.to_vec().unwrap(), &identities()).unwrap();
    let out = reparse(&out);
    assert_eq!(
      out.queries()[0].name(),
      &name("9.0.0.10.in-addr.arpa.")
    );
    assert_eq!(out.queries()[0].query_type(), RecordType::PTR);
  }

  #[test]
  fn a_question_is_never_rewritten() {
    // Even a question whose name happens to equal the device's reverse
    // name stays as-is when its type is A.
    let mut message = Message::new();
    message.add_query(Query::query(name("5.0.0.10.in-addr.arpa."), RecordType::A));

    let input = message.to_vec().unwrap();
    let out = translate(&input, &identities()).unwrap();
    assert_eq!(out, input);
  }

  #[test]
  fn ptr_answer_owner_rewritten_target_kept() {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.add_answer(Record::from_rdata(
      name("5.0.0.10.in-addr.arpa."),
      4500,
      RData::PTR(PTR(name("device.local."))),
    ));

    let out = translate(&message.to_vec().unwrap(), &identities()).unwrap();
    let out = reparse(&out);
    let answer = &out.answers()[0];
    assert_eq!(answer.name(), &name("9.0.0.10.in-addr.arpa."));
    assert_eq!(answer.ttl(), 4500);
    assert_eq!(answer.data(), Some(&RData::PTR(PTR(name("device.local.")))));
  }

  #[test]
  fn authority_and_additional_sections_are_rewritten_too() {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.add_name_server(Record::from_rdata(
      name("device.local."),
      120,
      RData::A(A("10.0.0.5".parse().unwrap())),
    ));
    message.add_additional(Record::from_rdata(
      name("5.0.0.10.in-addr.arpa."),
      120,
      RData::PTR(PTR(name("device.local."))),
    ));

    let out = translate(&message.to_vec().unwrap(), &identities()).unwrap();
    let out = reparse(&out);
    assert_eq!(
      out.name_servers()[0].data(),
      Some(&RData::A(A("10.0.0.9".parse().unwrap())))
    );
    assert_eq!(
      out.additionals()[0].name(),
      &name("9.0.0.10.in-addr.arpa.")
    );
  }

  #[test]
  fn second_pass_is_a_noop() {
    let ids = identities();
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message.add_query(Query::query(
      name("5.0.0.10.in-addr.arpa."),
      RecordType::PTR,
    ));
    message.add_answer(Record::from_rdata(
      name("device.local."),
      120,
      RData::A(A("10.0.0.5".parse().unwrap())),
    ));

    let first = translate(&message.to_vec().unwrap(), &ids).unwrap();
    let second = translate(&first, &ids).unwrap();
    assert_eq!(second, first);
  }

  #[test]
  fn roundtrip_without_applicable_rules_is_byte_identical() {
    let mut message = Message::new();
    message.set_id(0x2b2b);
    message.set_message_type(MessageType::Response);
    message.add_answer(Record::from_rdata(
      name("printer.local."),
      300,
      RData::TXT(TXT::new(vec!["model=emitter".to_string()])),
    ));
    message.add_answer(Record::from_rdata(
      name("printer.local."),
      300,
      RData::A(A(Ipv4Addr::new(192, 168, 4, 40))),
    ));

    let input = message.to_vec().unwrap();
    assert_eq!(translate(&input, &identities()).unwrap(), input);
  }

  #[test]
  fn non_query_opcode_passes_through_unmodified() {
    let mut message = Message::new();
    message.set_op_code(OpCode::Update);
    message.set_message_type(MessageType::Response);
    message.add_answer(Record::from_rdata(
      name("device.local."),
      120,
      RData::A(A("10.0.0.5".parse().unwrap())),
    ));

    let out = translate(&message.to_vec().unwrap(), &identities()).unwrap();
    let out = reparse(&out);
    assert_eq!(out.op_code(), OpCode::Update);
    // The device address survives: no rules are applied to non-queries.
    assert_eq!(
      out.answers()[0].data(),
      Some(&RData::A(A("10.0.0.5".parse().unwrap())))
    );
  }

  #[test]
  fn malformed_payload_yields_nothing() {
    let ids = identities();
    assert!(translate(&[], &ids).is_none());
    assert!(translate(&[0x01, 0x02, 0x03], &ids).is_none());
    // Truncated header: counts promise records that are not there.
    let mut truncated = Message::new()
      .add_query(Query::query(name("device.local."), RecordType::A))
      .to_vec()
      .unwrap();
    truncated.truncate(truncated.len() - 4);
    assert!(translate(&truncated, &ids).is_none());
  }
}
