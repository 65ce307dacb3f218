// SPDX-License-Identifier: MIT OR Apache-2.0

//! Software injectors: feeding packets from memory into a vDevice.
//!
//! Each injector owns one playback channel of the firmware. Data handed to
//! [`Hal::injector_add_node`] is copied into a DMA node; [`Hal::injector_start`] writes the nodes
//! out as a chain of playback records, the first one in the channel's record in dDEM and the rest
//! in a DMA table linked through `next_node`, and kicks the channel through the mailbox. The
//! firmware raises the channel's completion bit once it has played the last node.

/* ---------------------------------------------------------------------------------------------- */

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::backends::DmaAllocation;
use crate::error::{Error, Result};
use crate::hal::{Hal, PDeviceState};
use crate::interface::{injection_flags, mailbox_h2tp, Playback, PLAYBACK_TAG_IS_VDEVICE_INDEX};
use crate::objman::{Handle, ObjectKind};
use crate::regions::structured::TpStruct;
use crate::regions::{AsTpSubregion, BackedByTpSubregion, TpRegion};
use crate::sync::{Completion, Wait};

/* ---------------------------------------------------------------------------------------------- */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InjectorConfig {
    /// Nodes that can be queued before a start.
    pub max_nodes: u32,
}

impl Default for InjectorConfig {
    fn default() -> InjectorConfig {
        InjectorConfig { max_nodes: 32 }
    }
}

/// Tags carried by the packets of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectionTags {
    /// Bare packets. The firmware tags them for the injector's vDevice.
    Untagged,
    /// Packets already carry STFE tags naming their stream.
    Stfe,
    /// Packets carry DLNA time stamps.
    DlnaTts,
}

impl InjectionTags {
    fn flags(self) -> u32 {
        match self {
            InjectionTags::Untagged => injection_flags::EXCLUDES_TAGS,
            InjectionTags::Stfe => 0,
            InjectionTags::DlnaTts => injection_flags::INCLUDES_DLNA_TAGS,
        }
    }
}

#[derive(Debug)]
struct InjectNode {
    dma: DmaAllocation,
    len: u32,
    tags: InjectionTags,
}

#[derive(Debug)]
pub struct SoftwareInjector {
    vdevice: Handle,
    channel: u32,
    max_nodes: usize,
    nodes: Vec<InjectNode>,
    /// Playback records of every node but the first.
    chain: Option<DmaAllocation>,
    /// Raised when the channel is idle.
    completion: Arc<Completion>,
}

impl SoftwareInjector {
    fn busy(&self) -> bool {
        !self.completion.is_complete()
    }
}

/// One playback record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct NodeRecord {
    base: u32,
    len: u32,
    next: u32,
    flags: u32,
    tag: u32,
}

fn write_node(node: &Playback<'_>, channel: u32, packet_len: u32, r: &NodeRecord) -> Result<()> {
    node.channel().write(channel)?;
    node.buffer_base().write(r.base)?;
    node.num_of_bytes().write(r.len)?;
    node.next_node().write(r.next)?;
    node.packet_len().write(packet_len)?;
    node.injection_flags().write(r.flags)?;
    node.tag_header0().write(r.tag)?;
    node.tag_header1().write(0)?;
    node.ctrl().write(0)?;
    node.key_index().write(0)?;

    let checksum = [channel, r.base, r.len, r.next, packet_len, r.flags, r.tag]
        .iter()
        .fold(0u32, |sum, word| sum.wrapping_add(*word));
    node.checksum().write(checksum)?;
    Ok(())
}

/// The `index`th record of a chain table.
fn chain_node(chain: &DmaAllocation, index: usize) -> Playback<'_> {
    let region: &dyn TpRegion = &*chain.memory;
    let start = index as u64 * Playback::SIZE;
    Playback::backed_by(region.subregion(start..start + Playback::SIZE))
}

/* ---------------------------------------------------------------------------------------------- */

impl PDeviceState {
    pub(crate) fn injector_allocate(&mut self, parent: Handle, config: InjectorConfig) -> Result<Handle> {
        if config.max_nodes == 0 {
            return Err(Error::BadParameter);
        }
        let vdevice = self
            .links
            .ancestor(parent, ObjectKind::VDevice)
            .ok_or(Error::BadParameter)?;

        let completion = Arc::new(Completion::new());
        completion.complete();
        let handle = self.injectors.insert(SoftwareInjector {
            vdevice,
            channel: 0,
            max_nodes: config.max_nodes as usize,
            nodes: Vec::new(),
            chain: None,
            completion,
        })?;
        self.links.add_child(parent, handle);

        match self.injector_handles.add(handle) {
            Ok(channel) => {
                self.injectors.get_mut(handle)?.channel = channel as u32;
                debug!("Injector {:?} on playback channel {}", handle, channel);
                Ok(handle)
            }
            Err(e) => {
                self.discard(handle);
                Err(e)
            }
        }
    }

    pub(crate) fn injector_deallocate(&mut self, handle: Handle) -> Result<()> {
        if let Err(e) = self.injector_abort(handle) {
            warn!("Injector {:?} deallocated while it may still be playing: {}", handle, e);
        }
        self.injector_release_nodes(handle)?;
        let injector = self.injectors.remove(handle)?;
        self.injector_handles.remove(injector.channel as usize);
        Ok(())
    }

    fn injector_release_nodes(&mut self, handle: Handle) -> Result<()> {
        let injector = self.injectors.get_mut(handle)?;
        let chain = injector.chain.take();
        for node in injector.nodes.drain(..).map(|n| n.dma).chain(chain) {
            self.backend.free_dma(node.device_address);
        }
        Ok(())
    }

    fn injector_add_node(&mut self, handle: Handle, data: &[u8], tags: InjectionTags) -> Result<()> {
        {
            let injector = self.injectors.get(handle)?;
            if injector.busy() {
                return Err(Error::InjectorBusy);
            }
            if data.is_empty() || data.len() > u32::MAX as usize {
                return Err(Error::BadParameter);
            }
            if injector.nodes.len() >= injector.max_nodes {
                return Err(Error::NoMemory);
            }
        }

        let dma = self.backend.allocate_dma(data.len())?;
        if let Err(e) = dma.memory.write_bytes(0, data) {
            self.backend.free_dma(dma.device_address);
            return Err(e.into());
        }
        self.injectors.get_mut(handle)?.nodes.push(InjectNode {
            dma,
            len: data.len() as u32,
            tags,
        });
        Ok(())
    }

    fn injector_start(&mut self, handle: Handle) -> Result<()> {
        let tp = self.tp()?;
        let (vdevice, channel, count) = {
            let injector = self.injectors.get(handle)?;
            if injector.busy() {
                return Err(Error::InjectorBusy);
            }
            (injector.vdevice, injector.channel, injector.nodes.len())
        };
        if count == 0 {
            return Err(Error::BadParameter);
        }
        let packet_len = u32::from(self.vdevices.get(vdevice)?.config.packet_size);
        let tag = PLAYBACK_TAG_IS_VDEVICE_INDEX | u32::from(vdevice.index());

        if let Some(old) = self.injectors.get_mut(handle)?.chain.take() {
            self.backend.free_dma(old.device_address);
        }
        if count > 1 {
            let chain = self
                .backend
                .allocate_dma((count as u64 - 1) as usize * Playback::SIZE as usize)?;
            self.injectors.get_mut(handle)?.chain = Some(chain);
        }

        let injector = self.injectors.get(handle)?;
        let records = injector
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| NodeRecord {
                base: node.dma.device_address,
                len: node.len,
                next: match &injector.chain {
                    Some(chain) if i + 1 < count => {
                        chain.device_address + (i as u64 * Playback::SIZE) as u32
                    }
                    _ => 0,
                },
                flags: node.tags.flags()
                    | if i == 0 {
                        injection_flags::DISCARD_PREVIOUS_PARTIAL_PKT
                    } else {
                        0
                    },
                tag: if node.tags == InjectionTags::Stfe { 0 } else { tag },
            })
            .collect::<Vec<_>>();

        // The tail of the chain first, so that the firmware can follow it as soon as it sees the
        // head.
        if let Some(chain) = &injector.chain {
            for (i, record) in records.iter().enumerate().skip(1) {
                write_node(&chain_node(chain, i - 1), channel, packet_len, record)?;
            }
        }
        write_node(&tp.playback(channel)?, channel, packet_len, &records[0])?;
        fence(Ordering::Release);

        injector.completion.reset();
        if let Err(e) = self.backend.post_mailbox(mailbox_h2tp::START_PLAYBACK << channel) {
            injector.completion.complete();
            return Err(e);
        }
        trace!("Injector {:?}: playing {} nodes on channel {}", handle, count, channel);
        Ok(())
    }

    /// Called from the interrupt path when the firmware finished a playback channel.
    pub(crate) fn injector_completed(&self, channel: u32) {
        let injector = self
            .injector_handles
            .get(channel as usize)
            .and_then(|h| self.injectors.get(h).ok());
        match injector {
            Some(injector) => {
                trace!("Playback channel {} complete", channel);
                injector.completion.complete();
            }
            None => debug!("Completion for unused playback channel {}", channel),
        }
    }

    /// Stops the injector's channel if it is playing.
    pub(crate) fn injector_abort(&self, handle: Handle) -> Result<()> {
        let injector = self.injectors.get(handle)?;
        if !injector.busy() {
            return Ok(());
        }
        self.backend
            .post_mailbox(mailbox_h2tp::STOP_PLAYBACK << injector.channel)?;
        injector.completion.complete();
        debug!("Injector {:?} stopped", handle);
        Ok(())
    }

    fn injector_flush(&mut self, handle: Handle) -> Result<()> {
        if self.injectors.get(handle)?.busy() {
            return Err(Error::InjectorBusy);
        }
        self.injector_release_nodes(handle)
    }
}

/* ---------------------------------------------------------------------------------------------- */

impl Hal {
    /// Queues a copy of `data` to be played on the next start.
    pub fn injector_add_node(
        &self,
        injector: Handle,
        data: &[u8],
        tags: InjectionTags,
    ) -> Result<()> {
        injector.expect_kind(ObjectKind::SoftwareInjector)?;
        self.with_write(injector, |s| s.injector_add_node(injector, data, tags))
    }

    /// Plays every queued node, in order. Returns without waiting for the firmware.
    pub fn injector_start(&self, injector: Handle) -> Result<()> {
        injector.expect_kind(ObjectKind::SoftwareInjector)?;
        self.with_write(injector, |s| s.injector_start(injector))
    }

    /// Waits until the injector has played its nodes.
    ///
    /// `Some(0)` only looks. When a real timeout runs out the playback is stopped and
    /// [`Error::Timeout`] returned.
    pub fn injector_wait_for_completion(
        &self,
        injector: Handle,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        injector.expect_kind(ObjectKind::SoftwareInjector)?;
        let completion = self.with_read(injector, |s| {
            Ok(Arc::clone(&s.injectors.get(injector)?.completion))
        })?;

        let wait = Wait::from_millis(timeout_ms);
        match completion.wait(wait) {
            Err(Error::Timeout) if wait != Wait::Poll => {
                warn!("Injector {:?} timed out, stopping it", injector);
                self.with_read(injector, |s| s.injector_abort(injector))?;
                Err(Error::Timeout)
            }
            result => result,
        }
    }

    pub fn injector_abort(&self, injector: Handle) -> Result<()> {
        injector.expect_kind(ObjectKind::SoftwareInjector)?;
        self.with_read(injector, |s| s.injector_abort(injector))
    }

    /// Drops every queued node.
    pub fn injector_flush(&self, injector: Handle) -> Result<()> {
        injector.expect_kind(ObjectKind::SoftwareInjector)?;
        self.with_write(injector, |s| s.injector_flush(injector))
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::simulated::SimulatedTp;
    use crate::hal::testing::*;
    use crate::hal::AllocParams;
    use std::thread;
    use std::time::{Duration, Instant};

    fn injector(rig: &Rig, max_nodes: u32) -> Handle {
        rig.hal
            .allocate(
                rig.session,
                AllocParams::SoftwareInjector(InjectorConfig { max_nodes }),
            )
            .unwrap()
    }

    fn channel(rig: &Rig, injector: Handle) -> u32 {
        rig.hal
            .with_read(injector, |s| Ok(s.injectors.get(injector)?.channel))
            .unwrap()
    }

    /// Waits for the simulated firmware to pick up a mailbox command.
    fn wait_until_playing(tp: &SimulatedTp, channel: u32, playing: bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while tp.playback_active(channel) != playing {
            assert!(Instant::now() < deadline, "channel {} never changed", channel);
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn read_node(node: &Playback<'_>) -> NodeRecord {
        NodeRecord {
            base: node.buffer_base().read().unwrap(),
            len: node.num_of_bytes().read().unwrap(),
            next: node.next_node().read().unwrap(),
            flags: node.injection_flags().read().unwrap(),
            tag: node.tag_header0().read().unwrap(),
        }
    }

    #[test]
    fn test_start_writes_node_chain() {
        let rig = rig();
        let inj = injector(&rig, 4);
        let ch = channel(&rig, inj);
        rig.hal.injector_add_node(inj, &[0x47; 376], InjectionTags::Untagged).unwrap();
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Stfe).unwrap();
        rig.hal.injector_add_node(inj, &[0x47; 564], InjectionTags::DlnaTts).unwrap();
        rig.hal.injector_start(inj).unwrap();

        let (tp, bases, chain) = rig
            .hal
            .with_read(inj, |s| {
                let i = s.injectors.get(inj)?;
                let bases = i.nodes.iter().map(|n| n.dma.device_address).collect::<Vec<_>>();
                Ok((s.tp()?, bases, i.chain.clone().unwrap()))
            })
            .unwrap();
        let tag = PLAYBACK_TAG_IS_VDEVICE_INDEX | u32::from(rig.vdevice.index());

        let head = tp.playback(ch).unwrap();
        assert_eq!(head.channel().read().unwrap(), ch);
        assert_eq!(head.packet_len().read().unwrap(), 188);
        assert_eq!(
            read_node(&head),
            NodeRecord {
                base: bases[0],
                len: 376,
                next: chain.device_address,
                flags: injection_flags::EXCLUDES_TAGS | injection_flags::DISCARD_PREVIOUS_PARTIAL_PKT,
                tag,
            }
        );
        assert_eq!(
            read_node(&chain_node(&chain, 0)),
            NodeRecord {
                base: bases[1],
                len: 188,
                next: chain.device_address + Playback::SIZE as u32,
                flags: 0,
                tag: 0,
            }
        );
        assert_eq!(
            read_node(&chain_node(&chain, 1)),
            NodeRecord {
                base: bases[2],
                len: 564,
                next: 0,
                flags: injection_flags::INCLUDES_DLNA_TAGS,
                tag,
            }
        );

        wait_until_playing(&rig.tp, ch, true);
        rig.tp.complete_playback(ch);
        rig.hal.injector_wait_for_completion(inj, Some(5_000)).unwrap();
    }

    #[test]
    fn test_busy_injector_refuses_changes() {
        let rig = rig();
        let inj = injector(&rig, 4);
        let ch = channel(&rig, inj);
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_start(inj).unwrap();
        wait_until_playing(&rig.tp, ch, true);

        assert!(matches!(
            rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged),
            Err(Error::InjectorBusy)
        ));
        assert!(matches!(rig.hal.injector_start(inj), Err(Error::InjectorBusy)));
        assert!(matches!(rig.hal.injector_flush(inj), Err(Error::InjectorBusy)));
        assert!(matches!(
            rig.hal.injector_wait_for_completion(inj, Some(0)),
            Err(Error::Timeout)
        ));

        rig.hal.injector_abort(inj).unwrap();
        wait_until_playing(&rig.tp, ch, false);
        rig.hal.injector_wait_for_completion(inj, Some(0)).unwrap();

        // Restartable with the same nodes.
        rig.hal.injector_start(inj).unwrap();
        wait_until_playing(&rig.tp, ch, true);
        rig.tp.complete_playback(ch);
        rig.hal.injector_wait_for_completion(inj, None).unwrap();
    }

    #[test]
    fn test_wait_timeout_stops_playback() {
        let rig = rig();
        let inj = injector(&rig, 1);
        let ch = channel(&rig, inj);
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_start(inj).unwrap();

        assert!(matches!(
            rig.hal.injector_wait_for_completion(inj, Some(10)),
            Err(Error::Timeout)
        ));
        wait_until_playing(&rig.tp, ch, false);
        rig.hal.injector_flush(inj).unwrap();
    }

    #[test]
    fn test_waiter_wakes_on_completion() {
        let rig = rig();
        let inj = injector(&rig, 1);
        let ch = channel(&rig, inj);
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_start(inj).unwrap();
        wait_until_playing(&rig.tp, ch, true);

        thread::scope(|scope| {
            let waiter = scope.spawn(|| rig.hal.injector_wait_for_completion(inj, Some(5_000)));
            thread::sleep(Duration::from_millis(20));
            rig.tp.complete_playback(ch);
            waiter.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_node_rules() {
        let rig = rig();
        let inj = injector(&rig, 2);
        assert!(matches!(rig.hal.injector_start(inj), Err(Error::BadParameter)));
        assert!(matches!(
            rig.hal.injector_add_node(inj, &[], InjectionTags::Untagged),
            Err(Error::BadParameter)
        ));
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        assert!(matches!(
            rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged),
            Err(Error::NoMemory)
        ));
        assert!(matches!(
            rig.hal.allocate(
                rig.session,
                AllocParams::SoftwareInjector(InjectorConfig { max_nodes: 0 })
            ),
            Err(Error::BadParameter)
        ));
    }

    #[test]
    fn test_one_channel_per_injector() {
        let rig = rig();
        let a = injector(&rig, 1);
        let b = injector(&rig, 1);
        assert_eq!((channel(&rig, a), channel(&rig, b)), (0, 1));
        assert!(rig
            .hal
            .allocate(rig.session, AllocParams::SoftwareInjector(InjectorConfig::default()))
            .is_err());

        rig.hal.deallocate(a, false).unwrap();
        let c = injector(&rig, 1);
        assert_eq!(channel(&rig, c), 0);
    }

    #[test]
    fn test_nodes_and_chain_are_released() {
        let rig = rig();
        let before = rig.tp.dma_allocations();
        let inj = injector(&rig, 4);
        let ch = channel(&rig, inj);
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        assert_eq!(rig.tp.dma_allocations(), before + 2);

        rig.hal.injector_flush(inj).unwrap();
        assert_eq!(rig.tp.dma_allocations(), before);

        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_add_node(inj, &[0x47; 188], InjectionTags::Untagged).unwrap();
        rig.hal.injector_start(inj).unwrap();
        assert_eq!(rig.tp.dma_allocations(), before + 3);

        // Deallocating a playing injector stops it first.
        rig.hal.deallocate(inj, false).unwrap();
        assert_eq!(rig.tp.dma_allocations(), before);
        wait_until_playing(&rig.tp, ch, false);
    }
}

/* ---------------------------------------------------------------------------------------------- */
