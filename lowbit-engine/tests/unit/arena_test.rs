use super::*;

#[test]
fn test_alloc_bumps_cursor_and_high_water() {
    let mut arena = Arena::new(None);

    let a = arena.alloc(Region::Scratch0, 10).unwrap();
    let b = arena.alloc(Region::Scratch0, 6).unwrap();
    let c = arena.alloc(Region::NoBound, 4).unwrap();

    assert_eq!((a.offset, b.offset, c.offset), (0, 10, 0));
    assert_eq!(arena.high_water(Region::Scratch0), 16);
    assert_eq!(arena.high_water(Region::Scratch1), 0);
    assert_eq!(arena.planned_bytes(), 20 * 4);
    assert_eq!(arena.size_bytes(), 0);

    arena.commit();
    assert_eq!(arena.size_bytes(), 20 * 4);
}

#[test]
fn test_recycle_marks_older_spans_stale() {
    let mut arena = Arena::new(None);
    let old = arena.alloc(Region::Scratch1, 8).unwrap();

    arena.recycle(Region::Scratch1);
    let new = arena.alloc(Region::Scratch1, 4).unwrap();

    assert!(!arena.is_live(&old));
    assert!(arena.is_live(&new));
    assert!(old.overlaps(&new));
    // high water survives recycling
    assert_eq!(arena.high_water(Region::Scratch1), 8);
}

#[test]
fn test_limit_is_enforced() {
    let mut arena = Arena::new(Some(16));

    assert!(arena.alloc(Region::Scratch0, 16).is_ok());
    let err = arena.alloc(Region::Scratch0, 1).unwrap_err();
    assert!(err.to_string().contains("exhausted"));
}

#[test]
fn test_reset_keeps_buffers() {
    let mut arena = Arena::new(None);
    arena.alloc(Region::Scratch0, 32).unwrap();
    arena.recycle(Region::Scratch0);
    arena.commit();

    arena.reset();

    assert_eq!(arena.epoch(Region::Scratch0), 0);
    assert_eq!(arena.size_bytes(), 32 * 4);
    assert_eq!(arena.alloc(Region::Scratch0, 4).unwrap().offset, 0);
}

#[test]
fn test_split_io_reads_and_writes() {
    let mut arena = Arena::new(None);
    let a = arena.alloc(Region::Scratch0, 3).unwrap();
    let b = arena.alloc(Region::Scratch1, 3).unwrap();
    let out = arena.alloc(Region::Scratch0, 3).unwrap();
    arena.commit();
    arena.slice_mut(&a).copy_from_slice(&[1.0, 2.0, 3.0]);
    arena.slice_mut(&b).copy_from_slice(&[10.0, 20.0, 30.0]);

    let (inputs, output) = arena.split_io(&[a, b], &out).unwrap();
    output.iter_mut().enumerate().for_each(|(i, o)| *o = inputs[0][i] + inputs[1][i]);

    assert_eq!(arena.slice(&out), &[11.0, 22.0, 33.0]);
}

#[test]
fn test_split_io_rejects_overlap() {
    let mut arena = Arena::new(None);
    let a = arena.alloc(Region::Scratch0, 8).unwrap();
    arena.recycle(Region::Scratch0);
    let out = arena.alloc(Region::Scratch0, 8).unwrap();
    arena.commit();

    assert!(arena.split_io(&[a], &out).is_err());
}

#[test]
fn test_split_io_rejects_uncommitted_span() {
    let mut arena = Arena::new(None);
    let out = arena.alloc(Region::NoBound, 8).unwrap();

    assert!(arena.split_io(&[], &out).is_err());
}

#[test]
fn test_layers_alternate_scratch_regions() {
    assert_eq!(Region::for_layer(0), Region::Scratch0);
    assert_eq!(Region::for_layer(1), Region::Scratch1);
    assert_eq!(Region::for_layer(4), Region::Scratch0);
}
