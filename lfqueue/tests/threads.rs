#![cfg(not(loom))]
use lfqueue::{Error, Queue, RECORD_CAPACITY};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

mod util;

const PER_PRODUCER: u32 = if cfg!(miri) { 50 } else { 1000 };

fn record(producer: u32, seq: u32) -> [u8; 8] {
    let mut record = [0u8; 8];
    record[..4].copy_from_slice(&producer.to_le_bytes());
    record[4..].copy_from_slice(&seq.to_le_bytes());
    record
}

fn parse(record: &[u8]) -> (u32, u32) {
    let producer = u32::from_le_bytes(record[..4].try_into().unwrap());
    let seq = u32::from_le_bytes(record[4..8].try_into().unwrap());
    (producer, seq)
}

#[test]
fn no_record_is_lost_or_duplicated() {
    const PRODUCERS: u32 = 2;
    const CONSUMERS: usize = 2;
    util::trace_init();

    let q = Arc::new(Queue::<16>::new());
    let done = Arc::new(AtomicBool::new(false));

    let producers = (0..PRODUCERS)
        .map(|producer| {
            let q = q.clone();
            thread::spawn(move || {
                let handle = q.handle();
                for seq in 0..PER_PRODUCER {
                    handle.enqueue(&record(producer, seq)).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    let consumers = (0..CONSUMERS)
        .map(|_| {
            let q = q.clone();
            let done = done.clone();
            thread::spawn(move || {
                let handle = q.handle();
                let mut seen = Vec::new();
                let mut last = [None; PRODUCERS as usize];
                let mut buf = [0u8; 16];
                loop {
                    // Read the flag first: once every producer has finished,
                    // an empty queue stays empty.
                    let finished = done.load(Ordering::Acquire);
                    match handle.dequeue(&mut buf) {
                        Ok(len) => {
                            assert_eq!(len, 8);
                            let (producer, seq) = parse(&buf[..len]);
                            // Records from one producer reach any single
                            // consumer in the order they were enqueued.
                            let prev = last[producer as usize].replace(seq);
                            assert!(prev < Some(seq), "{prev:?} then {seq}");
                            seen.push((producer, seq));
                        }
                        Err(Error::Empty) if finished => break seen,
                        Err(Error::Empty) => thread::yield_now(),
                        Err(error) => panic!("unexpected error: {error}"),
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for producer in producers {
        producer.join().unwrap();
    }
    done.store(true, Ordering::Release);

    let mut all = HashSet::new();
    for consumer in consumers {
        for record in consumer.join().unwrap() {
            assert!(all.insert(record), "{record:?} was dequeued twice");
        }
    }

    assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
    for producer in 0..PRODUCERS {
        for seq in 0..PER_PRODUCER {
            assert!(all.contains(&(producer, seq)), "lost {producer}/{seq}");
        }
    }
    assert!(q.is_empty());
}

#[test]
fn single_producer_single_consumer_is_fifo() {
    util::trace_init();
    let q = Arc::new(Queue::<8>::new());

    let producer = {
        let q = q.clone();
        thread::spawn(move || {
            for seq in 0..PER_PRODUCER {
                q.enqueue(&seq.to_le_bytes()).unwrap();
            }
        })
    };

    let mut buf = [0u8; 8];
    let mut expected = 0;
    while expected < PER_PRODUCER {
        match q.dequeue(&mut buf) {
            Ok(len) => {
                assert_eq!(len, 4);
                let seq = u32::from_le_bytes(buf[..4].try_into().unwrap());
                assert_eq!(seq, expected);
                expected += 1;
            }
            Err(Error::Empty) => thread::yield_now(),
            Err(error) => panic!("unexpected error: {error}"),
        }
    }

    producer.join().unwrap();
    assert_eq!(q.dequeue(&mut buf), Err(Error::Empty));
}

#[test]
fn full_size_records_survive_contention() {
    const THREADS: u8 = 4;
    const RECORDS: usize = if cfg!(miri) { 10 } else { 200 };
    util::trace_init();

    let q = Arc::new(Queue::<RECORD_CAPACITY>::new());
    let threads = (0..THREADS)
        .map(|tag| {
            let q = q.clone();
            thread::spawn(move || {
                let mut buf = [0u8; RECORD_CAPACITY];
                let mut taken = 0;
                for _ in 0..RECORDS {
                    q.enqueue(&[tag; RECORD_CAPACITY]).unwrap();
                    if let Ok(len) = q.dequeue(&mut buf) {
                        assert_eq!(len, RECORD_CAPACITY);
                        // No record is ever torn.
                        assert!(buf.iter().all(|&b| b == buf[0]));
                        assert!(buf[0] < THREADS);
                        taken += 1;
                    }
                }
                taken
            })
        })
        .collect::<Vec<_>>();

    let taken: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
    let mut buf = [0u8; RECORD_CAPACITY];
    let mut rest = 0;
    while q.dequeue(&mut buf).is_ok() {
        rest += 1;
    }
    assert_eq!(taken + rest, THREADS as usize * RECORDS);
}
