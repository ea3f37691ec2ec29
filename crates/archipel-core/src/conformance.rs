// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Cross-module conformance: the full secure-channel pipeline and the
//! transfer integrity chain, exercised without sockets.

#[cfg(test)]
mod tests {
    use sha2::Digest;

    use crate::framing::{encode_frame, Deframer};
    use crate::handshake::{
        InitiatorHandshake, InitiatorStep, ResponderHandshake, ResponderStep, AUTH_LEN,
        HELLO_LEN, HELLO_REPLY_LEN,
    };
    use crate::identity::{NodeIdentity, PinBook};
    use crate::manifest::FileManifest;
    use crate::session::{SecureSession, PACKET_OVERHEAD};
    use crate::wire::{ChunkData, Envelope, Msg, WirePayload};

    #[test]
    fn handshake_wire_sizes_match_the_protocol() {
        assert_eq!(HELLO_LEN, 40);
        assert_eq!(HELLO_REPLY_LEN, 128);
        assert_eq!(AUTH_LEN, 96);
        assert_eq!(PACKET_OVERHEAD, 12 + 16);

        let (_, hello) = InitiatorHandshake::start();
        assert_eq!(hello.len(), HELLO_LEN);

        let responder = NodeIdentity::generate();
        let mut machine = ResponderHandshake::new();
        let reply = match machine
            .feed(&hello, &responder, &mut PinBook::memory())
            .expect("hello")
        {
            ResponderStep::Reply(reply) => reply,
            _ => panic!("expected reply"),
        };
        assert_eq!(reply.len(), HELLO_REPLY_LEN);
    }

    /// Handshake → session → envelope → framing, with the byte stream cut
    /// into awkward segment sizes on both legs.
    #[test]
    fn full_pipeline_survives_arbitrary_segmentation() {
        let alice = NodeIdentity::generate();
        let bob = NodeIdentity::generate();
        let mut alice_pins = PinBook::memory();
        let mut bob_pins = PinBook::memory();

        let (mut initiator, hello) = InitiatorHandshake::start();
        let mut responder = ResponderHandshake::new();
        let reply = match responder
            .feed(&hello, &bob, &mut bob_pins)
            .expect("hello")
        {
            ResponderStep::Reply(reply) => reply,
            _ => panic!("expected reply"),
        };
        let (auth, alice_link) = match initiator
            .feed(&reply, &alice, &mut alice_pins)
            .expect("reply")
        {
            InitiatorStep::Established { auth, link, .. } => (auth, link),
            InitiatorStep::NeedMore => panic!("expected establishment"),
        };

        // Alice's first application frame rides in the same segment as
        // her AUTH message.
        let alice_session = SecureSession::new(&alice_link.keys);
        let payload = WirePayload::Msg(Msg {
            content: "first frame, coalesced with AUTH".to_owned(),
        });
        let envelope_bytes = Envelope::from_typed(&payload)
            .and_then(|envelope| envelope.encode())
            .expect("encode envelope");
        let frame = encode_frame(&alice_session.encrypt(&envelope_bytes).expect("encrypt"))
            .expect("frame");

        let mut combined = auth.clone();
        combined.extend_from_slice(&frame);

        // Deliver to Bob in 7-byte segments.
        let mut bob_link = None;
        let mut deframer = Deframer::new();
        for segment in combined.chunks(7) {
            if bob_link.is_none() {
                match responder
                    .feed(segment, &bob, &mut bob_pins)
                    .expect("feed auth")
                {
                    ResponderStep::NeedMore => {}
                    ResponderStep::Established { link, leftover } => {
                        deframer = Deframer::with_leftover(leftover);
                        bob_link = Some(link);
                    }
                    _ => panic!("unexpected reply"),
                }
            } else {
                deframer.feed(segment);
            }
        }
        let bob_link = bob_link.expect("established");
        assert_eq!(bob_link.peer_id, alice.id);

        let bob_session = SecureSession::new(&bob_link.keys);
        let frame = deframer
            .next_frame()
            .expect("deframe")
            .expect("one complete frame");
        let plaintext = bob_session.decrypt(&frame).expect("decrypt");
        let decoded = Envelope::decode(&plaintext)
            .and_then(|envelope| envelope.decode_typed())
            .expect("decode");
        match decoded {
            WirePayload::Msg(msg) => {
                assert_eq!(msg.content, "first frame, coalesced with AUTH");
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(deframer.pending(), 0);
    }

    /// A corrupted chunk in transit never corrupts the reconstructed
    /// output: integrity is enforced per chunk against the manifest.
    #[test]
    fn transfer_chain_preserves_integrity_over_the_wire() {
        let sender = NodeIdentity::generate();
        let source: Vec<u8> = (0..3_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let manifest =
            FileManifest::from_bytes(&source, "payload.bin", 1024, &sender).expect("manifest");
        manifest.verify().expect("valid manifest");

        let mut output = vec![0u8; source.len()];
        for chunk in &manifest.chunks {
            let start = (chunk.index as usize) * 1024;
            let end = start + chunk.size as usize;
            let data = source[start..end].to_vec();

            // Corrupt the middle chunk on its first delivery.
            if chunk.index == 1 {
                let mut corrupted = data.clone();
                corrupted[0] ^= 0xFF;
                let wire = Envelope::from_typed(&WirePayload::ChunkData(ChunkData {
                    file_id: manifest.file_id,
                    index: chunk.index,
                    data: corrupted,
                }))
                .expect("envelope");
                let WirePayload::ChunkData(received) =
                    wire.decode_typed().expect("decode")
                else {
                    panic!("wrong variant");
                };
                let digest: [u8; 32] = sha2::Sha256::digest(&received.data).into();
                assert_ne!(digest, chunk.hash, "corruption must be detectable");
                // Discarded; a clean re-delivery follows.
            }

            let digest: [u8; 32] = sha2::Sha256::digest(&data).into();
            assert_eq!(digest, chunk.hash);
            output[start..end].copy_from_slice(&data);
        }
        assert_eq!(output, source);
    }
}
