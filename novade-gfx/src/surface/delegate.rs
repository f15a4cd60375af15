//! Host-drawn content rendered underneath the toolkit.

use crate::device::GfxDevice;
use crate::error::Result;
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DelegateId(pub(crate) u64);

/// Receives the surface's lifecycle and draws into the swapchain image before
/// the toolkit does.
///
/// The callbacks mirror the surface's build ladder. `draw` must wait on
/// `start` and signal `finish`, even when it records nothing.
pub trait SurfaceDelegate: Send {
    fn build_for_new_device(&mut self, device: &Arc<GfxDevice>) -> Result<()>;

    fn build_for_new_swapchain(
        &mut self,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
        format: vk::SurfaceFormatKHR,
    ) -> Result<()>;

    fn teardown_for_swapchain_lost(&mut self);

    fn teardown_for_device_lost(&mut self);

    fn draw(&mut self, image_index: u32, start: vk::Semaphore, finish: vk::Semaphore, render_area: vk::Rect2D) -> Result<()>;
}

pub(crate) struct DelegateEntry {
    pub id: DelegateId,
    pub delegate: Box<dyn SurfaceDelegate>,
    /// Signalled by this delegate's `draw`; null while no swapchain exists.
    pub semaphore: vk::Semaphore,
}

/// Registered delegates in drawing order.
#[derive(Default)]
pub(crate) struct DelegateList {
    entries: Vec<DelegateEntry>,
    next_id: u64,
}

impl DelegateList {
    pub fn push(&mut self, delegate: Box<dyn SurfaceDelegate>) -> DelegateId {
        let id = DelegateId(self.next_id);
        self.next_id += 1;
        self.entries.push(DelegateEntry {
            id,
            delegate,
            semaphore: vk::Semaphore::null(),
        });
        id
    }

    pub fn remove(&mut self, id: DelegateId) -> Option<DelegateEntry> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(index))
    }

    pub fn get_mut(&mut self, id: DelegateId) -> Option<&mut DelegateEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DelegateEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl SurfaceDelegate for Nop {
        fn build_for_new_device(&mut self, _device: &Arc<GfxDevice>) -> Result<()> {
            Ok(())
        }
        fn build_for_new_swapchain(&mut self, _: &[vk::ImageView], _: vk::Extent2D, _: vk::SurfaceFormatKHR) -> Result<()> {
            Ok(())
        }
        fn teardown_for_swapchain_lost(&mut self) {}
        fn teardown_for_device_lost(&mut self) {}
        fn draw(&mut self, _: u32, _: vk::Semaphore, _: vk::Semaphore, _: vk::Rect2D) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn ids_are_unique_and_removal_keeps_order() {
        let mut list = DelegateList::default();
        let a = list.push(Box::new(Nop));
        let b = list.push(Box::new(Nop));
        let c = list.push(Box::new(Nop));
        assert_ne!(a, b);

        assert!(list.remove(b).is_some());
        assert!(list.remove(b).is_none());
        let order: Vec<_> = list.iter_mut().map(|e| e.id).collect();
        assert_eq!(order, [a, c]);

        let d = list.push(Box::new(Nop));
        assert!(d > c);
        assert_eq!(list.len(), 3);
    }
}
