use crate::executor::Injector;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Wakes a task to resume execution.
///
/// The waker only carries the task id and the injector queue, so it stays `Send + Sync` even
/// though the task's future lives on the runtime thread. Waking pushes the id back on the
/// injector, and interrupts the reactor if the runtime is blocked in a poll.
struct WakerData {
    id: usize,
    injector: Arc<Injector>,
}

pub(crate) fn task_waker(id: usize, injector: Arc<Injector>) -> Waker {
    let data = Box::new(WakerData { id, injector });
    let ptr = Box::into_raw(data) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
}

unsafe fn clone(data: *const ()) -> RawWaker {
    // Borrow the data, the original waker keeps ownership
    let data = unsafe { &*(data as *const WakerData) };
    let cloned = Box::new(WakerData {
        id: data.id,
        injector: data.injector.clone(),
    });
    RawWaker::new(Box::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake(data: *const ()) {
    // Take ownership of the Box so it drops at the end of this function
    let data = unsafe { Box::from_raw(data as *mut WakerData) };
    data.injector.push(data.id);
}

unsafe fn wake_by_ref(data: *const ()) {
    let data = unsafe { &*(data as *const WakerData) };
    data.injector.push(data.id);
}

unsafe fn drop(data: *const ()) {
    // reclaim the Box and let it drop naturally
    let _ = unsafe { Box::from_raw(data as *mut WakerData) };
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    #[test]
    fn wake_pushes_task_id() {
        let (_reactor, unpark) = Reactor::new(8).unwrap();
        let injector = Arc::new(Injector::new(unpark));
        let waker = task_waker(7, injector.clone());

        waker.wake_by_ref();
        let cloned = waker.clone();
        cloned.wake();

        assert_eq!(injector.pop(), Some(7));
        assert_eq!(injector.pop(), Some(7));
        assert_eq!(injector.pop(), None);
    }
}
