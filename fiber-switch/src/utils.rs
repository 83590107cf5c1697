/// Helper function to push a value onto a stack being synthesized.
///
/// `None` leaves the slot uninitialized (padding).
#[inline]
pub unsafe fn push(sp: &mut usize, val: Option<usize>) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        if let Some(val) = val {
            *(*sp as *mut usize) = val;
        }
    }
}
