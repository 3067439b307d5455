/// Max bytes in a room number, room type or student id.
pub const MAX_ID_LEN: usize = 64;

/// Max bytes in a cancellation reason.
pub const MAX_REASON_LEN: usize = 512;

/// Max beds in a single room.
pub const MAX_ROOM_CAPACITY: u32 = 64;

/// Max bytes in a student's display name.
pub const MAX_STUDENT_NAME_LEN: usize = 128;

pub const MAX_ROOMS_PER_HOSTEL: usize = 100_000;

pub const MAX_HOSTELS: usize = 1_024;

pub const MAX_HOSTEL_NAME_LEN: usize = 128;

/// Max bytes in one protocol line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

pub const MAX_WATCHES_PER_CONNECTION: usize = 64;
