use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fieldcrypt_crypto::{is_encrypted, FieldCipher, FieldKey};

fn bench_envelopes(c: &mut Criterion) {
    let cipher = FieldCipher::new(FieldKey::generate(), vec![FieldKey::generate()]);
    let secret = "sk-live-0123456789abcdef0123456789abcdef";
    let envelope = cipher.encrypt_value(secret).unwrap();

    c.bench_function("encrypt_value", |b| {
        b.iter(|| cipher.encrypt_value(black_box(secret)).unwrap())
    });

    c.bench_function("decrypt_value_primary", |b| {
        b.iter(|| cipher.decrypt_value(black_box(&envelope)).unwrap())
    });

    let legacy_env = FieldCipher::new(cipher.snapshot().legacy()[0].clone(), vec![])
        .encrypt_value(secret)
        .unwrap();
    c.bench_function("decrypt_value_legacy_fallback", |b| {
        b.iter(|| cipher.decrypt_value(black_box(&legacy_env)).unwrap())
    });

    c.bench_function("is_encrypted", |b| {
        b.iter(|| is_encrypted(black_box(&envelope)))
    });
}

criterion_group!(benches, bench_envelopes);
criterion_main!(benches);
