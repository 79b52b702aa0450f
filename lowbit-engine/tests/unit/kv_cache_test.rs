use super::*;

fn rows(n: usize, kv_dim: usize, base: f32) -> Vec<f32> {
    (0..n * kv_dim).map(|i| base + i as f32).collect()
}

#[test]
fn test_store_writes_only_new_positions() {
    let mut cache = KvCache::new(KvType::F32, 2, 8, 4);
    cache.store(1, 0, &rows(3, 4, 0.0), &rows(3, 4, 100.0)).unwrap();

    cache.store(1, 3, &rows(2, 4, 50.0), &rows(2, 4, 500.0)).unwrap();

    let mut out = vec![0.0; 4];
    cache.read_key(1, 2, &mut out);
    assert_eq!(out, vec![8.0, 9.0, 10.0, 11.0]);
    cache.read_key(1, 3, &mut out);
    assert_eq!(out, vec![50.0, 51.0, 52.0, 53.0]);
    cache.read_value(1, 4, &mut out);
    assert_eq!(out, vec![504.0, 505.0, 506.0, 507.0]);

    // other layer untouched
    cache.read_key(0, 3, &mut out);
    assert_eq!(out, vec![0.0; 4]);
}

#[test]
fn test_store_rejects_overflow() {
    let mut cache = KvCache::new(KvType::F32, 1, 4, 2);

    let err = cache.store(0, 3, &rows(2, 2, 0.0), &rows(2, 2, 0.0)).unwrap_err();

    assert!(err.to_string().contains("overflow"));
    assert!(cache.check_capacity(2, 2).is_ok());
}

#[test]
fn test_store_rejects_ragged_rows() {
    let mut cache = KvCache::new(KvType::F32, 1, 4, 4);

    assert!(cache.store(0, 0, &[1.0; 6], &[1.0; 6]).is_err());
    assert!(cache.store(0, 0, &[1.0; 4], &[1.0; 8]).is_err());
    assert!(cache.store(1, 0, &[1.0; 4], &[1.0; 4]).is_err());
}

#[test]
fn test_store_does_not_advance_fill_counter() {
    let mut cache = KvCache::new(KvType::F32, 1, 4, 2);
    cache.store(0, 0, &rows(2, 2, 0.0), &rows(2, 2, 0.0)).unwrap();

    assert_eq!(cache.n(), 0);
    cache.advance(2);
    assert_eq!(cache.n(), 2);
    cache.clear();
    assert_eq!(cache.n(), 0);
}

#[test]
fn test_dot_and_add_value() {
    let mut cache = KvCache::new(KvType::F32, 1, 2, 4);
    cache.store(0, 1, &[1.0, 2.0, 3.0, 4.0], &[0.5, 0.5, 1.0, 1.0]).unwrap();

    assert_eq!(cache.dot_key(0, 1, 2, &[1.0, 1.0]), 7.0);

    let mut out = vec![1.0, 1.0];
    cache.add_value(0, 1, 2, 2.0, &mut out);
    assert_eq!(out, vec![3.0, 3.0]);
}

#[test]
fn test_f16_cache_rounds_values() {
    let mut cache = KvCache::new(KvType::F16, 1, 2, 2);
    cache.store(0, 0, &[0.1, 1.5], &[0.2, -2.0]).unwrap();

    let mut out = vec![0.0; 2];
    cache.read_key(0, 0, &mut out);

    assert_eq!(out[0], half::f16::from_f32(0.1).to_f32());
    assert_eq!(out[1], 1.5);
    assert_eq!(cache.size_bytes(), 2 * 2 * 2 * 2);
}
