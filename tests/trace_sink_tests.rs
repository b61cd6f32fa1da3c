//! Event trace sink round-trip through a file

use std::io::BufRead;
use std::sync::Arc;

use vramforge::device::{GpuDevice, HeapType, MockDevice, ResourceDescriptor, ResourceState};
use vramforge::trace::{EventSink, JsonLinesSink, TraceEvent};
use vramforge::{AllocationDescriptor, AllocatorDescriptor, RecordOptions, ResourceAllocator};

#[test]
fn test_json_lines_sink_writes_parseable_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alloc_trace.jsonl");

    let sink = Arc::new(JsonLinesSink::create(&path).unwrap());
    let descriptor = AllocatorDescriptor {
        preferred_resource_heap_size: 256 * 1024,
        max_resource_heap_size: 1024 * 1024,
        max_resource_size_for_pooling: 256 * 1024,
        record_options: RecordOptions {
            record_object_events: true,
            record_call_events: true,
            sink: Some(sink.clone()),
        },
        ..Default::default()
    };

    let device = Arc::new(MockDevice::new());
    let allocator =
        ResourceAllocator::new(device.clone() as Arc<dyn GpuDevice>, descriptor).unwrap();

    let allocation = allocator
        .create_resource(
            &AllocationDescriptor::with_heap_type(HeapType::Default),
            &ResourceDescriptor::buffer(64 * 1024),
            ResourceState::Common,
            None,
        )
        .unwrap();
    allocator.deallocate(allocation).unwrap();
    sink.flush();

    let file = std::fs::File::open(&path).unwrap();
    let events: Vec<TraceEvent> = std::io::BufReader::new(file)
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect();

    assert!(!events.is_empty());
    assert!(events.iter().any(|e| e.name == "create_resource"));
    assert!(events.iter().any(|e| e.category == "heap"));

    // Timestamps are monotonically non-decreasing.
    for pair in events.windows(2) {
        assert!(pair[0].timestamp_micros <= pair[1].timestamp_micros);
    }
}
