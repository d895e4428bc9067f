//! End to end behavior of `AllocatorContext` on the headless device.

use std::sync::Arc;

use kasa::{
    vk,
    AllocatorContext, AllocatorSettings, DebugSettings, DedicatedTarget,
    HeadlessDevice, HeadlessImage, RawDevice,
};

const KIB: vk::DeviceSize = 1 << 10;

fn context(settings: AllocatorSettings) -> (Arc<HeadlessDevice>, AllocatorContext) {
    let device = Arc::new(HeadlessDevice::new());
    let context = AllocatorContext::new(device.clone(), settings).unwrap();
    (device, context)
}

#[test]
fn staging_buffers_come_back_by_handle() {
    let (_device, ctx) = context(AllocatorSettings::default());
    let first = ctx.acquire_staging_buffer(4 * KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    let handle = first.buffer();
    ctx.release_staging_buffer(first, None);
    let second = ctx.acquire_staging_buffer(4 * KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    assert_eq!(second.buffer(), handle);
    ctx.release_staging_buffer(second, None);
    assert!(!ctx.shutdown().has_leaks());
}

#[test]
fn staging_buffers_released_with_a_command_buffer_wait_for_its_fence() {
    let (device, ctx) = context(AllocatorSettings::default());
    let cmd = ctx.submissions().register();
    let buffer = ctx.acquire_staging_buffer(KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    let handle = buffer.buffer();
    ctx.release_staging_buffer(buffer, Some(cmd));
    ctx.submissions().on_submitted(cmd);
    let other = ctx.acquire_staging_buffer(KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    assert_ne!(other.buffer(), handle);
    let mut fence = ctx.allocate_fence(false).unwrap();
    assert!(!ctx.poll_submission(cmd, &mut fence).unwrap());
    device.signal_fence(fence.handle());
    assert!(ctx.poll_submission(cmd, &mut fence).unwrap());
    ctx.process_pending_free(false, false);
    let reused = ctx.acquire_staging_buffer(KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    assert_eq!(reused.buffer(), handle);
    ctx.release_staging_buffer(reused, None);
    ctx.release_staging_buffer(other, None);
    ctx.release_fence(fence).unwrap();
}

#[test]
fn immediate_pending_free_returns_submitted_staging_buffers() {
    let (_device, ctx) = context(AllocatorSettings::default());
    let cmd = ctx.submissions().register();
    let buffer = ctx.acquire_staging_buffer(2 * KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    let handle = buffer.buffer();
    ctx.release_staging_buffer(buffer, Some(cmd));
    ctx.submissions().on_submitted(cmd);
    ctx.process_pending_free(true, false);
    let reused = ctx.acquire_staging_buffer(2 * KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    assert_eq!(reused.buffer(), handle);
    ctx.release_staging_buffer(reused, None);
    assert!(!ctx.shutdown().has_leaks());
}

#[test]
fn deferred_deletion_waits_for_age_and_fence() {
    let settings = AllocatorSettings::default().with_deletion_frame_delay(3);
    let (device, ctx) = context(settings);
    let cmd = ctx.submissions().register();
    ctx.submissions().set_active(cmd);
    let sampler: vk::Sampler = device.create_object();
    ctx.enqueue_deferred_deletion(sampler);
    ctx.submissions().on_submitted(cmd);
    let mut fence = ctx.allocate_fence(false).unwrap();
    for _ in 0..3 {
        ctx.begin_frame();
    }
    assert_eq!(ctx.frame_number(), 3);
    assert!(!device.was_destroyed(sampler));
    device.signal_fence(fence.handle());
    assert!(ctx.poll_submission(cmd, &mut fence).unwrap());
    assert_eq!(ctx.release_deferred_resources(false), 1);
    assert!(device.was_destroyed(sampler));
    ctx.release_fence(fence).unwrap();
}

#[test]
fn deferred_deletion_without_work_only_waits_for_age() {
    let (device, ctx) = context(AllocatorSettings::default().with_deletion_frame_delay(2));
    let view: vk::ImageView = device.create_object();
    ctx.enqueue_deferred_deletion(view);
    ctx.begin_frame();
    assert!(!device.was_destroyed(view));
    ctx.begin_frame();
    assert!(device.was_destroyed(view));
    assert_eq!(ctx.report().pending_deletions, 0);
}

#[test]
fn retiring_a_command_buffer_releases_what_waits_on_it() {
    let (device, ctx) = context(AllocatorSettings::default().with_deletion_frame_delay(0));
    let cmd = ctx.submissions().register();
    ctx.submissions().set_active(cmd);
    let framebuffer: vk::Framebuffer = device.create_object();
    ctx.enqueue_deferred_deletion(framebuffer);
    assert_eq!(ctx.release_deferred_resources(false), 0);
    ctx.on_command_buffer_retired(cmd);
    assert_eq!(ctx.release_deferred_resources(false), 1);
}

#[test]
fn temp_frame_tapes_grow_and_park_until_rotation() {
    let settings = AllocatorSettings::default().with_temp_frame_buffer_size(4 * KIB);
    let (_device, ctx) = context(settings);
    let first = ctx.temp_frame_alloc(4000, 16).unwrap();
    let grown = ctx.temp_frame_alloc(KIB, 256).unwrap();
    assert_ne!((grown.buffer, grown.bind_offset), (first.buffer, first.bind_offset));
    assert_eq!(grown.offset, 0);
    assert_eq!(grown.bind_offset % 256, 0);
    assert_eq!(ctx.report().temp_frames[0].parked, 1);
    assert_eq!(ctx.report().temp_frames[0].capacity, 8 * KIB);
    for _ in 0..3 {
        ctx.begin_frame();
    }
    let report = ctx.report().temp_frames[0];
    assert_eq!(report.parked, 0);
    assert_eq!(report.used, 0);
}

#[test]
fn images_fall_back_to_exact_size_pages() {
    let (device, ctx) = context(AllocatorSettings::default());
    device.fail_allocations_above(Some(64 * KIB));
    let image = device.create_image(HeadlessImage::new(32 * KIB, 4 * KIB));
    let allocation = ctx.allocate_image_memory(image, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
    assert_eq!(device.memory_size(allocation.memory()), Some(32 * KIB));
    assert_eq!(device.image_binding(image), Some((allocation.memory(), allocation.offset())));
    device.fail_allocations_above(None);
    ctx.release_resource(allocation);
}

#[test]
fn images_fall_back_to_another_memory_type() {
    let (device, ctx) = context(AllocatorSettings::default());
    let image = device.create_image(HeadlessImage::new(8 * KIB, 256).with_memory_type_bits(0b110));
    device.fail_next_allocations(2);
    let allocation = ctx.allocate_image_memory(image, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
    assert_eq!(allocation.memory_type_index(), 2);
    ctx.release_resource(allocation);
}

#[test]
fn dedicated_images_get_their_own_memory() {
    let (device, ctx) = context(AllocatorSettings::default());
    let image = device.create_image(HeadlessImage::new(64 * KIB, 4 * KIB).prefer_dedicated());
    let allocation = ctx.allocate_image_memory(image, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
    assert!(allocation.is_dedicated());
    assert_eq!(device.dedicated_target(allocation.memory()), Some(DedicatedTarget::Image(image)));
    assert_eq!(device.image_binding(image), Some((allocation.memory(), 0)));
    ctx.release_resource(allocation);
    assert_eq!(device.live_memory_count(), ctx.memory().live_allocation_count() as usize);
    let plain = device.create_image(HeadlessImage::new(16 * KIB, 4 * KIB));
    let allocation = ctx.allocate_dedicated_image_memory(plain, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
    assert!(allocation.is_dedicated());
    assert_eq!(device.memory_size(allocation.memory()), Some(16 * KIB));
    ctx.release_resource(allocation);
}

#[test]
fn preferred_dedicated_images_stay_pooled_when_disabled() {
    let (device, ctx) = context(AllocatorSettings::default().with_dedicated_allocations(false));
    let image = device.create_image(HeadlessImage::new(64 * KIB, 4 * KIB).prefer_dedicated());
    let allocation = ctx.allocate_image_memory(image, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
    assert!(!allocation.is_dedicated());
    ctx.release_resource(allocation);
}

#[test]
fn buffer_memory_is_bound_at_the_allocation_offset() {
    let (device, ctx) = context(AllocatorSettings::default());
    let buffer = device.create_buffer(1000, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
    let allocation = ctx.allocate_buffer_memory(buffer, vk::MemoryPropertyFlags::DEVICE_LOCAL, false).unwrap();
    assert_eq!(allocation.size(), 1024);
    assert_eq!(device.buffer_binding(buffer), Some((allocation.memory(), allocation.offset())));
    ctx.release_resource(allocation);
    unsafe {
        device.destroy_buffer(buffer);
    }
}

#[test]
fn hard_out_of_memory_is_returned_when_not_aborting() {
    let (device, ctx) = context(AllocatorSettings::default().with_abort_on_out_of_memory(false));
    device.fail_next_allocations(1);
    let err = ctx.allocate_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap_err();
    assert!(err.is_out_of_memory());
    let buffer = ctx.allocate_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    ctx.release_buffer(buffer);
}

#[test]
fn forced_coherent_operations_reach_the_device() {
    let debug = DebugSettings {
        force_coherent_operations: true,
        ..Default::default()
    };
    let (device, ctx) = context(AllocatorSettings::default().with_debug(debug));
    let readback = ctx.acquire_staging_buffer(100, vk::BufferUsageFlags::TRANSFER_DST, true).unwrap();
    ctx.invalidate_mapped_memory(&readback.mapped_range()).unwrap();
    ctx.flush_mapped_memory(&readback.mapped_range()).unwrap();
    assert_eq!(device.invalidate_count(), 1);
    assert_eq!(device.flush_count(), 1);
    ctx.release_staging_buffer(readback, None);
}

#[test]
fn shutdown_reports_leaks_once() {
    let (device, ctx) = context(AllocatorSettings::default());
    let _buffer = ctx.allocate_buffer(200, vk::BufferUsageFlags::VERTEX_BUFFER, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    let _fence = ctx.allocate_fence(false).unwrap();
    let leaks = ctx.shutdown();
    assert!(leaks.has_leaks());
    assert_eq!(leaks.buffers.suballocations, 1);
    assert_eq!(leaks.fences, 1);
    assert_eq!(leaks.pages.allocations, 0);
    assert_eq!(device.live_memory_count(), 0);
    assert!(!ctx.shutdown().has_leaks());
}

#[test]
fn clean_shutdown_returns_everything() {
    let (device, ctx) = context(AllocatorSettings::default());
    let buffer = ctx.allocate_buffer(300, vk::BufferUsageFlags::INDEX_BUFFER, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    let staging = ctx.acquire_staging_buffer(KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    let fence = ctx.allocate_fence(true).unwrap();
    ctx.release_buffer(buffer);
    ctx.release_staging_buffer(staging, None);
    ctx.release_fence(fence).unwrap();
    let report = ctx.report().to_string();
    assert!(report.contains("temp frame 0: 0/"));
    assert!(report.contains("(0.0%, peak 0)"));
    assert!(report.contains("fences: 0 in use, 1 free"));
    let leaks = ctx.shutdown();
    assert!(!leaks.has_leaks(), "{leaks}");
    assert_eq!(device.live_memory_count(), 0);
    assert_eq!(device.live_buffer_count(), 0);
    assert_eq!(device.live_fence_count(), 0);
}

#[test]
fn releasing_after_shutdown_is_ignored() {
    let (device, ctx) = context(AllocatorSettings::default());
    let buffer = ctx.allocate_buffer(128, vk::BufferUsageFlags::UNIFORM_BUFFER, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        .unwrap();
    let staging = ctx.acquire_staging_buffer(KIB, vk::BufferUsageFlags::TRANSFER_SRC, false).unwrap();
    let image = device.create_image(HeadlessImage::new(8 * KIB, 256));
    let memory = ctx.allocate_image_memory(image, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
    let leaks = ctx.shutdown();
    assert_eq!(leaks.staging_buffers, 1);
    ctx.release_buffer(buffer);
    ctx.release_staging_buffer(staging, None);
    ctx.release_resource(memory);
    assert_eq!(device.live_memory_count(), 0);
    assert_eq!(device.live_buffer_count(), 0);
}
