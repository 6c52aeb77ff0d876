use doclink_core::{
    decode_embedding, encode_embedding, CryptoVault, DeterministicKeyStore, DoclinkError, FileId,
    SealedText,
};
use proptest::prelude::*;

fn vault() -> CryptoVault<DeterministicKeyStore> {
    CryptoVault::new(DeterministicKeyStore::new(b"property-seed".to_vec()))
}

#[derive(Clone, Debug)]
enum Field {
    Ciphertext,
    Nonce,
    Tag,
}

proptest! {
    #[test]
    fn decrypt_inverts_encrypt(text in "\\PC{0,200}", file in "[a-z0-9-]{1,36}") {
        let vault = vault();
        let file_id = FileId::new(file);
        let sealed = vault.encrypt(&file_id, &text).expect("encrypt");
        prop_assert_eq!(vault.decrypt(&file_id, &sealed).expect("decrypt"), text);
    }

    #[test]
    fn any_single_byte_change_fails_authentication(
        text in "[A-Za-z0-9 .,%-]{1,120}",
        field in prop_oneof![Just(Field::Ciphertext), Just(Field::Nonce), Just(Field::Tag)],
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let vault = vault();
        let file_id = FileId::new("file-under-test");
        let mut sealed = vault.encrypt(&file_id, &text).expect("encrypt");
        match field {
            Field::Ciphertext => {
                let idx = position.index(sealed.ciphertext.len());
                sealed.ciphertext[idx] ^= flip;
            }
            Field::Nonce => {
                let idx = position.index(sealed.nonce.len());
                sealed.nonce[idx] ^= flip;
            }
            Field::Tag => {
                let idx = position.index(sealed.tag.len());
                sealed.tag[idx] ^= flip;
            }
        }
        let is_auth_failure = matches!(
            vault.decrypt(&file_id, &sealed),
            Err(DoclinkError::AuthenticationFailure { .. })
        );
        prop_assert!(is_auth_failure);
    }

    #[test]
    fn envelope_bytes_survive_transport(text in "\\PC{0,64}") {
        let vault = vault();
        let file_id = FileId::new("envelope");
        let sealed = vault.encrypt(&file_id, &text).expect("encrypt");
        let restored = SealedText::from_bytes(&sealed.to_bytes()).expect("decode envelope");
        prop_assert_eq!(vault.decrypt(&file_id, &restored).expect("decrypt"), text);
    }

    #[test]
    fn embedding_codec_is_exact_for_finite_vectors(
        vector in prop::collection::vec(-1.0e6f32..1.0e6f32, 1..64),
    ) {
        let decoded = decode_embedding(&encode_embedding(&vector), vector.len()).expect("decode");
        prop_assert_eq!(decoded, vector);
    }
}
