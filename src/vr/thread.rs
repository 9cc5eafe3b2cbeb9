#[derive(Debug, Clone)]
pub struct VirtualThread {
    pub pid: i32,
    pub tid: i32,
    pub name: String,
}

impl VirtualThread {
    pub fn new(pid: i32, tid: i32) -> VirtualThread {
        VirtualThread {
            pid,
            tid,
            name: String::new(),
        }
    }
}
