#[cfg(all(test, feature = "loom"))]
mod tests {
    use crate::{ReaderId, SharedBuffer};
    use loom::{model::Builder, sync::Arc, thread};
    use std::time::Duration;

    fn builder() -> Builder {
        let mut builder = Builder::new();
        if builder.preemption_bound.is_none() {
            builder.preemption_bound = Some(3);
        }
        builder
    }

    fn drain(buffer: &SharedBuffer<u32>, reader: ReaderId, into: &mut Vec<u32>) {
        while let Some(value) = buffer.read(reader, false).into_item() {
            into.push(value);
        }
    }

    #[test]
    fn test_writer_and_two_readers() {
        builder().check(|| {
            let buffer = Arc::new(SharedBuffer::new(Duration::from_millis(1)));
            let num_messages = 3;

            let writer = {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..num_messages {
                        buffer.insert(i).unwrap();
                    }
                })
            };

            let analytics = {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    drain(&buffer, ReaderId::Analytics, &mut seen);
                    seen
                })
            };

            let mut persistence = Vec::new();
            drain(&buffer, ReaderId::Persistence, &mut persistence);

            writer.join().unwrap();
            let mut analytics = analytics.join().unwrap();

            drain(&buffer, ReaderId::Analytics, &mut analytics);
            drain(&buffer, ReaderId::Persistence, &mut persistence);

            let expected: Vec<u32> = (0..num_messages).collect();
            assert_eq!(analytics, expected);
            assert_eq!(persistence, expected);
        });
    }

    #[test]
    fn test_sweep_races_reads() {
        builder().check(|| {
            let buffer = Arc::new(SharedBuffer::new(Duration::from_millis(1)));
            buffer.insert(0u32).unwrap();
            buffer.insert(1u32).unwrap();

            let sweeper = {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    buffer.remove_consumed();
                })
            };

            let reader = {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    drain(&buffer, ReaderId::Analytics, &mut seen);
                    seen
                })
            };

            let mut persistence = Vec::new();
            drain(&buffer, ReaderId::Persistence, &mut persistence);

            sweeper.join().unwrap();
            assert_eq!(reader.join().unwrap(), vec![0, 1]);
            assert_eq!(persistence, vec![0, 1]);

            buffer.remove_consumed();
            assert!(buffer.is_empty());
        });
    }
}
