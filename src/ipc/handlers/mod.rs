pub mod classes;
pub mod core;
pub mod feedback;
pub mod grades;
pub mod leave;
pub mod notifications;
pub mod reference;
pub mod timetable;
pub mod users;
