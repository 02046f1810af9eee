//! Property-based tests for RelayGate
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Queue Naming Properties
// ============================================================================

mod naming_properties {
    use super::*;
    use relaygate_relay::SessionId;

    proptest! {
        /// The four names carry the right prefixes and suffixes and never collide
        #[test]
        fn quadruple_shape(
            peer in "[a-z][a-z0-9.]{0,30}",
            queue_id in "[A-Za-z0-9_-]{1,32}",
        ) {
            let session = SessionId::new(peer.clone(), queue_id.clone()).unwrap();
            let queues = session.queues();

            prop_assert_eq!(&queues.request, &format!("REQ-{peer}-{queue_id}"));
            prop_assert_eq!(&queues.response, &format!("RESP-{peer}-{queue_id}"));
            prop_assert_eq!(&queues.request_control, &format!("{}-CONTROL", queues.request));
            prop_assert_eq!(&queues.response_control, &format!("{}-CONTROL", queues.response));

            let names = queues.names();
            for (i, a) in names.iter().enumerate() {
                for b in &names[i + 1..] {
                    prop_assert_ne!(a, b);
                }
            }
            prop_assert!(queues.is_control(&queues.request_control));
            prop_assert!(!queues.is_control(&queues.request));
        }

        /// Naming is a pure function of the session id
        #[test]
        fn naming_is_deterministic(
            peer in "[a-z.]{1,20}",
            queue_id in "[A-Za-z0-9]{1,24}",
        ) {
            let a = SessionId::new(peer.clone(), queue_id.clone()).unwrap();
            let b = SessionId::new(peer, queue_id).unwrap();
            prop_assert_eq!(a.queues(), b.queues());
        }

        /// Display and parse agree for queue ids without a slash
        #[test]
        fn session_id_text_form(
            peer in "[a-z./]{1,20}",
            queue_id in "[A-Za-z0-9]{1,24}",
        ) {
            let session = SessionId::new(peer, queue_id).unwrap();
            let parsed: SessionId = session.to_string().parse().unwrap();
            prop_assert_eq!(parsed, session);
        }
    }
}

// ============================================================================
// Sealed Envelope Properties
// ============================================================================

mod envelope_properties {
    use super::*;
    use rand_core::OsRng;
    use relaygate_crypto::{ENVELOPE_OVERHEAD, Identity, open, seal};
    use std::sync::OnceLock;

    fn pair() -> &'static (Identity, Identity) {
        static PAIR: OnceLock<(Identity, Identity)> = OnceLock::new();
        PAIR.get_or_init(|| (Identity::generate(&mut OsRng), Identity::generate(&mut OsRng)))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Sealed payloads open to the same bytes with a fixed overhead
        #[test]
        fn seal_then_open(payload in prop::collection::vec(any::<u8>(), 0..4096)) {
            let (sender, recipient) = pair();
            let envelope = seal(sender, &recipient.public_key(), &payload).unwrap();
            prop_assert_eq!(envelope.len(), payload.len() + ENVELOPE_OVERHEAD);

            let opened = open(recipient, &sender.public_key(), &envelope).unwrap();
            prop_assert_eq!(opened, payload);
        }

        /// Any single flipped bit is an authentication failure
        #[test]
        fn bit_flip_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let (sender, recipient) = pair();
            let mut envelope = seal(sender, &recipient.public_key(), &payload).unwrap();
            let index = position.index(envelope.len());
            envelope[index] ^= 1 << bit;

            let err = open(recipient, &sender.public_key(), &envelope).unwrap_err();
            prop_assert!(err.is_authentication_failure(), "unexpected error {err:?}");
        }

        /// Truncated envelopes never open
        #[test]
        fn truncation_rejected(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            cut in any::<prop::sample::Index>(),
        ) {
            let (sender, recipient) = pair();
            let envelope = seal(sender, &recipient.public_key(), &payload).unwrap();
            let keep = cut.index(envelope.len());

            prop_assert!(open(recipient, &sender.public_key(), &envelope[..keep]).is_err());
        }
    }

    #[test]
    fn third_party_cannot_open() {
        let (sender, recipient) = pair();
        let eavesdropper = Identity::generate(&mut OsRng);
        let envelope = seal(sender, &recipient.public_key(), b"for recipient only").unwrap();

        let err = open(&eavesdropper, &sender.public_key(), &envelope).unwrap_err();
        assert!(err.is_authentication_failure());
    }
}

// ============================================================================
// Control Message Properties
// ============================================================================

mod control_properties {
    use super::*;
    use relaygate_relay::{ControlMessage, ErrorKind, RelayDescriptor, SessionId};

    proptest! {
        /// CLOSE is only accepted by the session it names
        #[test]
        fn close_bound_to_queue_id(
            ours in "[A-Za-z0-9]{1,16}",
            theirs in "[A-Za-z0-9]{1,16}",
        ) {
            let session = SessionId::new("gatekeeper.cloudA", ours.clone()).unwrap();
            let other = SessionId::new("gatekeeper.cloudA", theirs.clone()).unwrap();

            let body = ControlMessage::close(&other).to_bytes().unwrap();
            let decoded = ControlMessage::from_bytes(&body).unwrap();

            if ours == theirs {
                prop_assert!(decoded.expect_close(&session).is_ok());
            } else {
                let err = decoded.expect_close(&session).unwrap_err();
                prop_assert_eq!(err.kind(), ErrorKind::Security);
            }
        }

        /// Data payloads are never mistaken for control messages
        #[test]
        fn data_is_not_control(payload in prop::collection::vec(any::<u8>(), 0..256)) {
            prop_assume!(!payload.starts_with(b"RGC1"));
            let err = ControlMessage::from_bytes(&payload).unwrap_err();
            prop_assert_eq!(err.kind(), ErrorKind::Protocol);
        }

        /// SWITCH carries its target relay through encoding
        #[test]
        fn switch_keeps_target(
            host in "[a-z]{1,12}(\\.[a-z]{2,6})?",
            port in 1u16..,
        ) {
            let session = SessionId::new("gatekeeper.cloudA", "q1").unwrap();
            let relay = RelayDescriptor::new(host, port);
            let body = ControlMessage::switch(&session, relay.clone()).to_bytes().unwrap();

            let request = ControlMessage::from_bytes(&body)
                .unwrap()
                .expect_switch(&session)
                .unwrap();
            prop_assert_eq!(request.relay, relay);
            prop_assert_eq!(request.session, session);
        }
    }
}
