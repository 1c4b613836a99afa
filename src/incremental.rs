use crate::change_id::ChangeToken;
use crate::disk::DiskDescriptor;
use crate::export::ExportReader;
use crate::hypervisor::{DiskArea, Hypervisor};
use crate::status::ProgressSink;
use crate::target::{AlignedBuf, BlockWriter};
use crate::{MigrateError, Result, log_debug, log_info};

/// Upper bound on a single read/write, whatever the size of a changed range.
pub const MAX_CHUNK: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementalStats {
    pub ranges: usize,
    pub chunks: usize,
    pub bytes: u64,
}

/// Widen `area` outward to `alignment` and clamp it to `capacity`.
/// Returns `None` for areas that end up empty.
pub fn widen(area: DiskArea, alignment: u64, capacity: u64) -> Option<(u64, u64)> {
    let alignment = alignment.max(1);
    let end = area.start.saturating_add(area.length).min(capacity);
    if area.length == 0 || area.start >= end {
        return None;
    }
    let start = area.start - area.start % alignment;
    let end = end
        .div_ceil(alignment)
        .saturating_mul(alignment)
        .min(capacity);
    Some((start, end))
}

/// Split `[start, end)` into consecutive pieces of at most [`MAX_CHUNK`].
pub fn chunks(start: u64, end: u64) -> impl Iterator<Item = (u64, u64)> {
    let mut offset = start;
    std::iter::from_fn(move || {
        if offset >= end {
            return None;
        }
        let len = (end - offset).min(MAX_CHUNK);
        let chunk = (offset, len);
        offset += len;
        Some(chunk)
    })
}

fn percent(offset: u64, capacity: u64) -> u64 {
    if capacity == 0 {
        100
    } else {
        offset.min(capacity) * 100 / capacity
    }
}

/// Copy every area that changed since `base` into the target.
///
/// Ranges are written in the order the hypervisor returns them and the
/// writer is flushed before returning. Persisting the new token is left to
/// the caller, which must only do so after this returns `Ok`.
pub async fn copy_changed(
    hypervisor: &dyn Hypervisor,
    snapshot_ref: &str,
    disk: &DiskDescriptor,
    base: &ChangeToken,
    reader: &mut dyn ExportReader,
    writer: &mut dyn BlockWriter,
    progress: &mut dyn ProgressSink,
) -> Result<IncrementalStats> {
    let capacity = disk.capacity_bytes;
    let alignment = writer.alignment();
    let mut stats = IncrementalStats::default();
    let mut buf: Option<AlignedBuf> = None;

    log_info!(
        "Incremental copy of '{}' from change id {}",
        disk.label,
        base
    );
    progress.report(format!("Syncing disk {}: 0%", disk.label), true);

    let mut start_offset = 0u64;
    while start_offset < capacity {
        let page = hypervisor
            .query_changed_areas(snapshot_ref, disk.key, start_offset, &base.raw)
            .await?;
        log_debug!(
            "'{}': {} changed area(s) in [{}, {})",
            disk.label,
            page.areas.len(),
            page.start_offset,
            page.next_start()
        );

        for area in &page.areas {
            let Some((start, end)) = widen(*area, alignment, capacity) else {
                continue;
            };
            stats.ranges += 1;
            for (offset, len) in chunks(start, end) {
                let len_usize = len as usize;
                if buf.as_ref().is_none_or(|b| b.capacity() < len_usize) {
                    buf = Some(AlignedBuf::new(len_usize));
                }
                let chunk_buf = buf.get_or_insert_with(|| AlignedBuf::new(len_usize));
                reader
                    .read_exact_at(offset, chunk_buf.slice_mut(len_usize))
                    .await?;
                writer.write_at(offset, chunk_buf.slice(len_usize))?;
                stats.chunks += 1;
                stats.bytes += len;
                progress.report(
                    format!(
                        "Syncing disk {}: {}%",
                        disk.label,
                        percent(offset + len, capacity)
                    ),
                    false,
                );
            }
        }

        let next = page.next_start();
        if next <= start_offset || next > capacity {
            return Err(MigrateError::Copy(format!(
                "changed-area query for '{}' returned next offset {} after {} (capacity {})",
                disk.label, next, start_offset, capacity
            )));
        }
        start_offset = next;
    }

    writer.flush()?;
    progress.report(
        format!(
            "Synced disk {}: {} changed range(s), {} bytes",
            disk.label, stats.ranges, stats.bytes
        ),
        true,
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{DiskMode, HardwareDevice, SharingMode};
    use crate::hypervisor::ChangedAreas;
    use crate::status::NullProgress;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    struct PagedAreas {
        pages: Vec<ChangedAreas>,
        queries: Mutex<Vec<(u64, String)>>,
    }

    #[async_trait]
    impl Hypervisor for PagedAreas {
        fn vm_name(&self) -> &str {
            "web"
        }
        async fn vm_ref(&self) -> Result<String> {
            Ok("vm-42".to_string())
        }
        async fn create_snapshot(&self, _name: &str) -> Result<String> {
            unreachable!()
        }
        async fn remove_snapshot(&self, _snapshot_ref: &str, _consolidate: bool) -> Result<()> {
            unreachable!()
        }
        async fn snapshot_devices(&self, _snapshot_ref: &str) -> Result<Vec<HardwareDevice>> {
            unreachable!()
        }
        async fn query_changed_areas(
            &self,
            _snapshot_ref: &str,
            _disk_key: i32,
            start_offset: u64,
            change_id: &str,
        ) -> Result<ChangedAreas> {
            self.queries
                .lock()
                .unwrap()
                .push((start_offset, change_id.to_string()));
            self.pages
                .iter()
                .find(|p| p.start_offset == start_offset)
                .cloned()
                .ok_or_else(|| MigrateError::Hypervisor("no page".to_string()))
        }
        async fn power_off(&self) -> Result<()> {
            unreachable!()
        }
    }

    /// Reads return a pattern derived from the offset.
    struct PatternReader {
        size: u64,
        reads: Vec<(u64, usize)>,
    }

    fn pattern(offset: u64) -> u8 {
        (offset % 251) as u8
    }

    #[async_trait]
    impl ExportReader for PatternReader {
        fn size(&self) -> u64 {
            self.size
        }
        async fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.reads.push((offset, buf.len()));
            for (i, b) in buf.iter_mut().enumerate() {
                *b = pattern(offset + i as u64);
            }
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct MemWriter {
        image: Option<Vec<u8>>,
        alignment: u64,
        writes: Vec<(u64, usize)>,
        fail_after: Option<usize>,
        flushed: bool,
    }

    impl MemWriter {
        fn recording(alignment: u64) -> Self {
            Self {
                image: None,
                alignment,
                writes: vec![],
                fail_after: None,
                flushed: false,
            }
        }
    }

    impl BlockWriter for MemWriter {
        fn alignment(&self) -> u64 {
            self.alignment
        }
        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
            if self.fail_after == Some(self.writes.len()) {
                return Err(MigrateError::Target("injected EIO".to_string()));
            }
            self.writes.push((offset, data.len()));
            if let Some(image) = &mut self.image {
                image[offset as usize..offset as usize + data.len()].copy_from_slice(data);
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    fn disk(capacity: u64) -> DiskDescriptor {
        DiskDescriptor {
            key: 2000,
            label: "Hard disk 1".to_string(),
            capacity_bytes: capacity,
            backing_file: "[ds1] web/web.vmdk".to_string(),
            snapshot_chain: vec![],
            sharing: SharingMode::NoSharing,
            disk_mode: DiskMode::Persistent,
            change_id: Some("52 aa/9".to_string()),
        }
    }

    fn page(start: u64, length: u64, areas: &[(u64, u64)]) -> ChangedAreas {
        ChangedAreas {
            start_offset: start,
            length,
            areas: areas
                .iter()
                .map(|&(start, length)| DiskArea { start, length })
                .collect(),
        }
    }

    fn base() -> ChangeToken {
        ChangeToken::parse("52 aa/3").unwrap()
    }

    #[test]
    fn widening_rounds_out_and_clamps() {
        let area = |start, length| DiskArea { start, length };
        assert_eq!(widen(area(1000, 100), 512, 1 << 20), Some((512, 1536)));
        assert_eq!(widen(area(1024, 512), 512, 1 << 20), Some((1024, 1536)));
        assert_eq!(widen(area(4000, 500), 512, 4096), Some((3584, 4096)));
        assert_eq!(widen(area(8192, 10), 512, 4096), None);
        assert_eq!(widen(area(100, 0), 512, 4096), None);
        assert_eq!(widen(area(3, 5), 1, 4096), Some((3, 8)));
    }

    #[test]
    fn chunks_cover_range_exactly() {
        let start = 3 * MIB;
        let end = start + 200 * MIB + 512;
        let pieces: Vec<_> = chunks(start, end).collect();
        assert!(pieces.iter().all(|&(_, len)| len <= MAX_CHUNK));
        assert_eq!(pieces.first().unwrap().0, start);
        for pair in pieces.windows(2) {
            assert_eq!(pair[0].0 + pair[0].1, pair[1].0);
        }
        let total: u64 = pieces.iter().map(|&(_, len)| len).sum();
        assert_eq!(total, end - start);
    }

    #[tokio::test]
    async fn large_range_is_split_into_bounded_chunks() {
        let capacity = 10 * 1024 * MIB;
        let hv = PagedAreas {
            pages: vec![page(0, capacity, &[(0, 128 * MIB)])],
            queries: Mutex::new(vec![]),
        };
        let mut reader = PatternReader {
            size: capacity,
            reads: vec![],
        };
        let mut writer = MemWriter::recording(512);

        let stats = copy_changed(
            &hv,
            "snapshot-7",
            &disk(capacity),
            &base(),
            &mut reader,
            &mut writer,
            &mut NullProgress,
        )
        .await
        .unwrap();

        let expected = vec![(0, 64 * MIB as usize), (64 * MIB, 64 * MIB as usize)];
        assert_eq!(reader.reads, expected);
        assert_eq!(writer.writes, expected);
        assert_eq!(stats.chunks, 2);
        assert!(writer.flushed);
        assert_eq!(*hv.queries.lock().unwrap(), vec![(0, "52 aa/3".to_string())]);
    }

    #[tokio::test]
    async fn follows_pages_until_capacity() {
        let capacity = 8 * MIB;
        let hv = PagedAreas {
            pages: vec![
                page(0, 4 * MIB, &[(4096, 4096)]),
                page(4 * MIB, 4 * MIB, &[(5 * MIB, 1000)]),
            ],
            queries: Mutex::new(vec![]),
        };
        let mut reader = PatternReader {
            size: capacity,
            reads: vec![],
        };
        let mut writer = MemWriter::recording(512);

        copy_changed(
            &hv,
            "snapshot-7",
            &disk(capacity),
            &base(),
            &mut reader,
            &mut writer,
            &mut NullProgress,
        )
        .await
        .unwrap();

        assert_eq!(writer.writes, vec![(4096, 4096), (5 * MIB, 1024)]);
        let offsets: Vec<u64> = hv.queries.lock().unwrap().iter().map(|q| q.0).collect();
        assert_eq!(offsets, vec![0, 4 * MIB]);
    }

    #[tokio::test]
    async fn rerun_produces_identical_target() {
        let capacity = MIB;
        let hv = PagedAreas {
            pages: vec![page(0, capacity, &[(0, 8192), (300_000, 70_000)])],
            queries: Mutex::new(vec![]),
        };
        let mut images = Vec::new();
        for _ in 0..2 {
            let mut reader = PatternReader {
                size: capacity,
                reads: vec![],
            };
            let mut writer = MemWriter::recording(512);
            writer.image = Some(vec![0u8; capacity as usize]);
            copy_changed(
                &hv,
                "snapshot-7",
                &disk(capacity),
                &base(),
                &mut reader,
                &mut writer,
                &mut NullProgress,
            )
            .await
            .unwrap();
            images.push(writer.image.unwrap());
        }
        assert_eq!(images[0], images[1]);
        assert_eq!(images[0][300_000], pattern(300_000));
        assert_eq!(images[0][200_000], 0);
    }

    #[tokio::test]
    async fn write_failure_aborts_without_flush() {
        let capacity = MIB;
        let hv = PagedAreas {
            pages: vec![page(0, capacity, &[(0, 4096), (8192, 4096), (16384, 4096)])],
            queries: Mutex::new(vec![]),
        };
        let mut reader = PatternReader {
            size: capacity,
            reads: vec![],
        };
        let mut writer = MemWriter::recording(512);
        writer.fail_after = Some(1);

        let result = copy_changed(
            &hv,
            "snapshot-7",
            &disk(capacity),
            &base(),
            &mut reader,
            &mut writer,
            &mut NullProgress,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(writer.writes, vec![(0, 4096)]);
        assert!(!writer.flushed);
    }

    #[tokio::test]
    async fn stalled_pagination_is_an_error() {
        let capacity = MIB;
        let hv = PagedAreas {
            pages: vec![page(0, 0, &[])],
            queries: Mutex::new(vec![]),
        };
        let mut reader = PatternReader {
            size: capacity,
            reads: vec![],
        };
        let mut writer = MemWriter::recording(1);
        let err = copy_changed(
            &hv,
            "snapshot-7",
            &disk(capacity),
            &base(),
            &mut reader,
            &mut writer,
            &mut NullProgress,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("next offset"));
    }
}
