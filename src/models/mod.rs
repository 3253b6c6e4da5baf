pub mod account;
pub mod invoice;
pub mod room;
pub mod seat;
pub mod show;

pub use account::{Account, Caller, Role};
pub use invoice::{FoodLine, Invoice, InvoiceStatus, RefundRecord, Voucher};
pub use room::{CinemaRoom, RoomStatus};
pub use seat::{CoupleSeat, Seat, SeatStatus, SeatType, SeatTypeUpdate};
pub use show::{Movie, MovieShow, DEFAULT_POSTER, NewShow, ScheduleSeat, ScheduleSeatStatus, ShowRecord, Version};
