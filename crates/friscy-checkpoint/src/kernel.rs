//! Bookkeeping operations on [`EmulatedKernelState`] used by the syscall-emulation layer.

use std::collections::BTreeMap;

use crate::error::KernelError;
use crate::types::{EmulatedKernelState, EpollInstance, EpollInterest, SchedulerState};

/// First pid handed out to a child; pid 1 is the initial guest process.
pub const FIRST_CHILD_PID: i32 = 2;

/// First synthetic epoll descriptor. Kept clear of the stdio, JSON-channel and socket windows.
pub const EPOLL_FD_BASE: i32 = 1000;

/// Largest value an eventfd counter may hold.
pub const EVENTFD_MAX: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpollOp {
    Add,
    Modify,
    Delete,
}

impl Default for EmulatedKernelState {
    fn default() -> Self {
        Self {
            scheduler: SchedulerState::default(),
            next_pid: FIRST_CHILD_PID,
            next_epoll_fd: EPOLL_FD_BASE,
            epoll_instances: BTreeMap::new(),
            eventfd_counters: BTreeMap::new(),
        }
    }
}

impl EmulatedKernelState {
    pub fn alloc_pid(&mut self) -> Result<i32, KernelError> {
        let pid = self.next_pid;
        self.next_pid = pid
            .checked_add(1)
            .ok_or(KernelError::DescriptorSpaceExhausted)?;
        Ok(pid)
    }

    /// Whether `fd` names a synthetic epoll instance or an eventfd.
    pub fn is_descriptor_in_use(&self, fd: i32) -> bool {
        self.epoll_instances.contains_key(&fd) || self.eventfd_counters.contains_key(&fd)
    }

    pub fn epoll_create(&mut self) -> Result<i32, KernelError> {
        let mut epfd = self.next_epoll_fd.max(EPOLL_FD_BASE);
        while self.is_descriptor_in_use(epfd) {
            epfd = epfd
                .checked_add(1)
                .ok_or(KernelError::DescriptorSpaceExhausted)?;
        }
        self.next_epoll_fd = epfd
            .checked_add(1)
            .ok_or(KernelError::DescriptorSpaceExhausted)?;
        self.epoll_instances.insert(epfd, EpollInstance::default());
        Ok(epfd)
    }

    pub fn epoll_ctl(
        &mut self,
        epfd: i32,
        op: EpollOp,
        fd: i32,
        interest: EpollInterest,
    ) -> Result<(), KernelError> {
        let instance = self
            .epoll_instances
            .get_mut(&epfd)
            .ok_or(KernelError::NoSuchEpoll(epfd))?;
        match op {
            EpollOp::Add => {
                if instance.interests.contains_key(&fd) {
                    return Err(KernelError::InterestExists { epfd, fd });
                }
                instance.interests.insert(fd, interest);
            }
            EpollOp::Modify => {
                let slot = instance
                    .interests
                    .get_mut(&fd)
                    .ok_or(KernelError::NoSuchInterest { epfd, fd })?;
                *slot = interest;
            }
            EpollOp::Delete => {
                instance
                    .interests
                    .remove(&fd)
                    .ok_or(KernelError::NoSuchInterest { epfd, fd })?;
            }
        }
        Ok(())
    }

    pub fn epoll_close(&mut self, epfd: i32) -> Result<EpollInstance, KernelError> {
        self.epoll_instances
            .remove(&epfd)
            .ok_or(KernelError::NoSuchEpoll(epfd))
    }

    pub fn eventfd_create(&mut self, fd: i32, initial: u64) -> Result<(), KernelError> {
        if self.is_descriptor_in_use(fd) {
            return Err(KernelError::DescriptorExists(fd));
        }
        if initial > EVENTFD_MAX {
            return Err(KernelError::CounterOverflow);
        }
        self.eventfd_counters.insert(fd, initial);
        Ok(())
    }

    /// Add `value` to the counter and return the new value.
    pub fn eventfd_write(&mut self, fd: i32, value: u64) -> Result<u64, KernelError> {
        let counter = self
            .eventfd_counters
            .get_mut(&fd)
            .ok_or(KernelError::NoSuchEventFd(fd))?;
        let next = counter
            .checked_add(value)
            .filter(|&v| v <= EVENTFD_MAX)
            .ok_or(KernelError::CounterOverflow)?;
        *counter = next;
        Ok(next)
    }

    /// Return the counter and reset it to zero.
    pub fn eventfd_read(&mut self, fd: i32) -> Result<u64, KernelError> {
        let counter = self
            .eventfd_counters
            .get_mut(&fd)
            .ok_or(KernelError::NoSuchEventFd(fd))?;
        if *counter == 0 {
            return Err(KernelError::WouldBlock);
        }
        Ok(std::mem::take(counter))
    }

    /// Drop every trace of a closed descriptor: its eventfd counter (if any) and its
    /// registration in every epoll interest set. Returns whether anything was removed.
    pub fn forget_descriptor(&mut self, fd: i32) -> bool {
        let mut removed = self.eventfd_counters.remove(&fd).is_some();
        for instance in self.epoll_instances.values_mut() {
            removed |= instance.interests.remove(&fd).is_some();
        }
        removed
    }
}
