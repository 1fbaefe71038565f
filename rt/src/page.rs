use rustix::param;

pub(crate) fn page_size() -> usize {
    param::page_size()
}

/// Rounds `size` up to the nearest multiple of the page size.
pub(crate) fn multiple_of_page_size(size: usize) -> usize {
    let page = page_size();

    (size + (page - 1)) & !(page - 1)
}

pub(crate) fn is_multiple_of_page_size(size: usize) -> bool {
    size % page_size() == 0
}
